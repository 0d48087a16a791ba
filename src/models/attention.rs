// src/models/attention.rs

use ndarray::{s, Array2, ArrayViewD, ArrayViewMutD, Axis};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::layers::{Activation, Dense, DenseCache, Dropout, Parameters};

/// Multi-head scaled dot-product attention.
///
/// Query, key and value projections map `features` to `num_heads * key_dim`;
/// the output projection maps the concatenated heads back to `features`.
/// Dropout is applied to the attention probabilities while training.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiHeadAttention {
    num_heads: usize,
    key_dim: usize,
    query: Dense,
    key: Dense,
    value: Dense,
    output: Dense,
    dropout: Dropout,
}

#[derive(Debug, Clone)]
pub struct AttentionCache {
    query: DenseCache,
    key: DenseCache,
    value: DenseCache,
    output: DenseCache,
    probabilities: Vec<Array2<f64>>,
    masks: Vec<Option<Array2<f64>>>,
}

impl MultiHeadAttention {
    pub fn new<R: Rng + ?Sized>(
        features: usize,
        num_heads: usize,
        key_dim: usize,
        dropout: f64,
        rng: &mut R,
    ) -> Self {
        let width = num_heads * key_dim;
        MultiHeadAttention {
            num_heads,
            key_dim,
            query: Dense::new(features, width, Activation::Linear, rng),
            key: Dense::new(features, width, Activation::Linear, rng),
            value: Dense::new(features, width, Activation::Linear, rng),
            output: Dense::new(width, features, Activation::Linear, rng),
            dropout: Dropout::new(dropout),
        }
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn key_dim(&self) -> usize {
        self.key_dim
    }

    fn scale(&self) -> f64 {
        1.0 / (self.key_dim as f64).sqrt()
    }

    /// Self-attention over the rows of `input`.
    pub fn forward(
        &self,
        input: &Array2<f64>,
        rng: Option<&mut StdRng>,
    ) -> (Array2<f64>, AttentionCache) {
        let mut rng = rng;
        let kd = self.key_dim;
        let head = |h: usize| s![.., h * kd..(h + 1) * kd];

        let (q, query) = self.query.forward(input);
        let (k, key) = self.key.forward(input);
        let (v, value) = self.value.forward(input);

        let mut context = Array2::<f64>::zeros(q.raw_dim());
        let mut probabilities = Vec::with_capacity(self.num_heads);
        let mut masks = Vec::with_capacity(self.num_heads);
        for h in 0..self.num_heads {
            let mut scores = q.slice(head(h)).dot(&k.slice(head(h)).t()) * self.scale();
            softmax_rows(&mut scores);
            let (attended, mask) = self.dropout.forward(&scores, rng.as_deref_mut());
            context
                .slice_mut(head(h))
                .assign(&attended.dot(&v.slice(head(h))));
            probabilities.push(scores);
            masks.push(mask);
        }

        let (output, output_cache) = self.output.forward(&context);
        let cache = AttentionCache {
            query,
            key,
            value,
            output: output_cache,
            probabilities,
            masks,
        };
        (output, cache)
    }

    /// Gradient with respect to the input, summed over the query, key and value paths.
    pub fn backward(
        &self,
        cache: &AttentionCache,
        grad_output: &Array2<f64>,
        grads: &mut MultiHeadAttention,
    ) -> Array2<f64> {
        let kd = self.key_dim;
        let head = |h: usize| s![.., h * kd..(h + 1) * kd];
        let scale = self.scale();

        let d_context = self
            .output
            .backward(&cache.output, grad_output, &mut grads.output);

        let q = cache.query.output();
        let k = cache.key.output();
        let v = cache.value.output();
        let mut d_q = Array2::<f64>::zeros(q.raw_dim());
        let mut d_k = Array2::<f64>::zeros(k.raw_dim());
        let mut d_v = Array2::<f64>::zeros(v.raw_dim());

        for h in 0..self.num_heads {
            let probs = &cache.probabilities[h];
            let mask = cache.masks[h].as_ref();
            let d_head = d_context.slice(head(h));

            let attended = match mask {
                Some(mask) => probs * mask,
                None => probs.clone(),
            };
            d_v.slice_mut(head(h)).assign(&attended.t().dot(&d_head));

            let d_attended = d_head.dot(&v.slice(head(h)).t());
            let d_probs = self.dropout.backward(mask, &d_attended);

            // softmax: dS = P * (dP - rowsum(dP * P))
            let row_dot = (&d_probs * probs).sum_axis(Axis(1)).insert_axis(Axis(1));
            let mut d_scores = &d_probs - &row_dot;
            d_scores *= probs;
            d_scores *= scale;

            d_q.slice_mut(head(h)).assign(&d_scores.dot(&k.slice(head(h))));
            d_k.slice_mut(head(h)).assign(&d_scores.t().dot(&q.slice(head(h))));
        }

        let mut d_input = self.query.backward(&cache.query, &d_q, &mut grads.query);
        d_input += &self.key.backward(&cache.key, &d_k, &mut grads.key);
        d_input += &self.value.backward(&cache.value, &d_v, &mut grads.value);
        d_input
    }

    pub(crate) fn projections(&self) -> [(&'static str, &Dense); 4] {
        [
            ("query", &self.query),
            ("key", &self.key),
            ("value", &self.value),
            ("output", &self.output),
        ]
    }
}

impl Parameters for MultiHeadAttention {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f64>> {
        let mut params = self.query.parameters();
        params.extend(self.key.parameters());
        params.extend(self.value.parameters());
        params.extend(self.output.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        let mut params = self.query.parameters_mut();
        params.extend(self.key.parameters_mut());
        params.extend(self.value.parameters_mut());
        params.extend(self.output.parameters_mut());
        params
    }
}

fn softmax_rows(scores: &mut Array2<f64>) {
    for mut row in scores.rows_mut() {
        let max = row.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::layers::testing::check_parameter_gradients;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let mut scores = array![[1.0, 2.0, 3.0], [1000.0, 1000.0, 1000.0]];
        softmax_rows(&mut scores);
        for row in scores.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-12);
        }
        assert!((scores[[1, 0]] - 1.0 / 3.0).abs() < 1e-12);
        assert!(scores[[0, 2]] > scores[[0, 1]]);
    }

    #[test]
    fn test_attention_output_shape_and_parameter_count() {
        let mut rng = StdRng::seed_from_u64(1);
        let attention = MultiHeadAttention::new(1, 4, 256, 0.1, &mut rng);
        let input = Array2::from_shape_fn((100, 1), |(i, _)| i as f64 / 100.0);
        let (output, _) = attention.forward(&input, None);
        assert_eq!(output.dim(), (100, 1));
        // 3 * (1 * 1024 + 1024) + (1024 * 1 + 1)
        assert_eq!(attention.num_parameters(), 7169);
    }

    #[test]
    fn test_attention_gradients() {
        let mut rng = StdRng::seed_from_u64(5);
        let attention = MultiHeadAttention::new(3, 2, 4, 0.0, &mut rng);
        let input = Array2::from_shape_fn((6, 3), |_| rng.gen_range(-1.0..1.0));
        let probe = Array2::from_shape_fn((6, 3), |_| rng.gen_range(-1.0..1.0));
        let loss = |a: &MultiHeadAttention, x: &Array2<f64>| (a.forward(x, None).0 * &probe).sum();

        let (_, cache) = attention.forward(&input, None);
        let mut grads = attention.zeros_like();
        let input_grad = attention.backward(&cache, &probe, &mut grads);

        check_parameter_gradients(&attention, &grads, |a| loss(a, &input));

        let eps = 1e-6;
        for ((i, j), &expected) in input_grad.indexed_iter() {
            let mut plus = input.clone();
            plus[[i, j]] += eps;
            let mut minus = input.clone();
            minus[[i, j]] -= eps;
            let numeric = (loss(&attention, &plus) - loss(&attention, &minus)) / (2.0 * eps);
            assert!(
                (numeric - expected).abs() < 1e-5,
                "input ({}, {}): numeric {} vs analytic {}",
                i,
                j,
                numeric,
                expected
            );
        }
    }

    #[test]
    fn test_attention_dropout_gradients_follow_mask() {
        let mut rng = StdRng::seed_from_u64(9);
        let attention = MultiHeadAttention::new(2, 2, 3, 0.3, &mut rng);
        let input = Array2::from_shape_fn((5, 2), |_| rng.gen_range(-1.0..1.0));
        let probe = Array2::from_shape_fn((5, 2), |_| rng.gen_range(-1.0..1.0));
        let loss = |a: &MultiHeadAttention| {
            let mut dropout_rng = StdRng::seed_from_u64(77);
            (a.forward(&input, Some(&mut dropout_rng)).0 * &probe).sum()
        };

        let mut dropout_rng = StdRng::seed_from_u64(77);
        let (_, cache) = attention.forward(&input, Some(&mut dropout_rng));
        let mut grads = attention.zeros_like();
        attention.backward(&cache, &probe, &mut grads);

        check_parameter_gradients(&attention, &grads, loss);
    }
}
