// src/models/network.rs

use std::fmt::Write as _;

use log::debug;
use ndarray::{Array2, ArrayView2, ArrayViewD, ArrayViewMutD};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::attention::{AttentionCache, MultiHeadAttention};
use super::layers::{
    Activation, DataFormat, Dense, DenseCache, Dropout, GlobalAveragePooling1D, LayerNorm,
    LayerNormCache, Parameters,
};
use crate::error::Result;

const LAYER_NORM_EPSILON: f64 = 1e-6;

/// Hyperparameters of the encoder-plus-head regressor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Width of each attention head (query/key/value size).
    pub head_size: usize,
    pub num_heads: usize,
    /// Hidden width of the position-wise feed-forward stage.
    pub ff_dim: usize,
    /// Dropout inside the encoder block, including attention probabilities.
    pub dropout: f64,
    pub hidden_units: usize,
    /// Dropout between pooling and the dense head.
    pub head_dropout: f64,
    pub pooling: DataFormat,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            head_size: 256,
            num_heads: 4,
            ff_dim: 4,
            dropout: 0.1,
            hidden_units: 20,
            head_dropout: 0.1,
            pooling: DataFormat::ChannelsFirst,
        }
    }
}

/// Pre-norm Transformer encoder block with two residual connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderBlock {
    attention_norm: LayerNorm,
    attention: MultiHeadAttention,
    attention_dropout: Dropout,
    feed_forward_norm: LayerNorm,
    feed_forward: Dense,
    feed_forward_dropout: Dropout,
    projection: Dense,
}

#[derive(Debug, Clone)]
pub struct EncoderCache {
    attention_norm: LayerNormCache,
    attention: AttentionCache,
    attention_mask: Option<Array2<f64>>,
    feed_forward_norm: LayerNormCache,
    feed_forward: DenseCache,
    feed_forward_mask: Option<Array2<f64>>,
    projection: DenseCache,
}

impl EncoderBlock {
    pub fn new<R: Rng + ?Sized>(features: usize, config: &ModelConfig, rng: &mut R) -> Self {
        EncoderBlock {
            attention_norm: LayerNorm::new(features, LAYER_NORM_EPSILON),
            attention: MultiHeadAttention::new(
                features,
                config.num_heads,
                config.head_size,
                config.dropout,
                rng,
            ),
            attention_dropout: Dropout::new(config.dropout),
            feed_forward_norm: LayerNorm::new(features, LAYER_NORM_EPSILON),
            feed_forward: Dense::new(features, config.ff_dim, Activation::Relu, rng),
            feed_forward_dropout: Dropout::new(config.dropout),
            projection: Dense::new(config.ff_dim, features, Activation::Linear, rng),
        }
    }

    pub fn forward(
        &self,
        input: &Array2<f64>,
        rng: Option<&mut StdRng>,
    ) -> (Array2<f64>, EncoderCache) {
        let mut rng = rng;

        let (normed, attention_norm) = self.attention_norm.forward(input);
        let (attended, attention) = self.attention.forward(&normed, rng.as_deref_mut());
        let (attended, attention_mask) = self
            .attention_dropout
            .forward(&attended, rng.as_deref_mut());
        let residual = attended + input;

        let (normed, feed_forward_norm) = self.feed_forward_norm.forward(&residual);
        let (hidden, feed_forward) = self.feed_forward.forward(&normed);
        let (hidden, feed_forward_mask) = self
            .feed_forward_dropout
            .forward(&hidden, rng.as_deref_mut());
        let (projected, projection) = self.projection.forward(&hidden);
        let output = projected + &residual;

        let cache = EncoderCache {
            attention_norm,
            attention,
            attention_mask,
            feed_forward_norm,
            feed_forward,
            feed_forward_mask,
            projection,
        };
        (output, cache)
    }

    pub fn backward(
        &self,
        cache: &EncoderCache,
        grad_output: &Array2<f64>,
        grads: &mut EncoderBlock,
    ) -> Array2<f64> {
        let d_hidden = self
            .projection
            .backward(&cache.projection, grad_output, &mut grads.projection);
        let d_hidden = self
            .feed_forward_dropout
            .backward(cache.feed_forward_mask.as_ref(), &d_hidden);
        let d_normed =
            self.feed_forward
                .backward(&cache.feed_forward, &d_hidden, &mut grads.feed_forward);
        let mut d_residual = self.feed_forward_norm.backward(
            &cache.feed_forward_norm,
            &d_normed,
            &mut grads.feed_forward_norm,
        );
        d_residual += grad_output;

        let d_attended = self
            .attention_dropout
            .backward(cache.attention_mask.as_ref(), &d_residual);
        let d_normed = self
            .attention
            .backward(&cache.attention, &d_attended, &mut grads.attention);
        let mut d_input =
            self.attention_norm
                .backward(&cache.attention_norm, &d_normed, &mut grads.attention_norm);
        d_input += &d_residual;
        d_input
    }
}

impl Parameters for EncoderBlock {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f64>> {
        let mut params = self.attention_norm.parameters();
        params.extend(self.attention.parameters());
        params.extend(self.feed_forward_norm.parameters());
        params.extend(self.feed_forward.parameters());
        params.extend(self.projection.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        let mut params = self.attention_norm.parameters_mut();
        params.extend(self.attention.parameters_mut());
        params.extend(self.feed_forward_norm.parameters_mut());
        params.extend(self.feed_forward.parameters_mut());
        params.extend(self.projection.parameters_mut());
        params
    }
}

/// Maps a `(steps, features)` window to a scalar prediction:
/// encoder block, global average pooling, dropout, dense relu, dense linear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerRegressor {
    steps: usize,
    features: usize,
    encoder: EncoderBlock,
    pooling: GlobalAveragePooling1D,
    head_dropout: Dropout,
    hidden: Dense,
    output: Dense,
}

#[derive(Debug, Clone)]
pub struct RegressorCache {
    encoder: EncoderCache,
    head_mask: Option<Array2<f64>>,
    hidden: DenseCache,
    output: DenseCache,
}

impl TransformerRegressor {
    /// Builds a freshly initialised network for windows of `steps` rows and `features` columns.
    pub fn new<R: Rng + ?Sized>(
        config: &ModelConfig,
        steps: usize,
        features: usize,
        rng: &mut R,
    ) -> Self {
        let encoder = EncoderBlock::new(features, config, rng);
        let pooling = GlobalAveragePooling1D::new(config.pooling);
        let pooled = pooling.output_len(steps, features);
        TransformerRegressor {
            steps,
            features,
            encoder,
            pooling,
            head_dropout: Dropout::new(config.head_dropout),
            hidden: Dense::new(pooled, config.hidden_units, Activation::Relu, rng),
            output: Dense::new(config.hidden_units, 1, Activation::Linear, rng),
        }
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Runs one window through the network. Dropout is active only when `rng` is given.
    pub fn forward(
        &self,
        window: ArrayView2<'_, f64>,
        rng: Option<&mut StdRng>,
    ) -> (f64, RegressorCache) {
        let mut rng = rng;
        let (encoded, encoder) = self.encoder.forward(&window.to_owned(), rng.as_deref_mut());
        let pooled = self.pooling.forward(&encoded);
        let (pooled, head_mask) = self.head_dropout.forward(&pooled, rng.as_deref_mut());
        let (hidden, hidden_cache) = self.hidden.forward(&pooled);
        let (output, output_cache) = self.output.forward(&hidden);

        let cache = RegressorCache {
            encoder,
            head_mask,
            hidden: hidden_cache,
            output: output_cache,
        };
        (output[[0, 0]], cache)
    }

    /// Back-propagates `d_prediction` (the loss gradient for this sample) into `grads`.
    pub fn backward(&self, cache: &RegressorCache, d_prediction: f64, grads: &mut Self) {
        let grad = Array2::from_elem((1, 1), d_prediction);
        let d_hidden = self.output.backward(&cache.output, &grad, &mut grads.output);
        let d_pooled = self.hidden.backward(&cache.hidden, &d_hidden, &mut grads.hidden);
        let d_pooled = self.head_dropout.backward(cache.head_mask.as_ref(), &d_pooled);
        let d_encoded = self
            .pooling
            .backward((self.steps, self.features), &d_pooled);
        self.encoder
            .backward(&cache.encoder, &d_encoded, &mut grads.encoder);
    }

    /// Inference-mode prediction for one window.
    pub fn predict(&self, window: ArrayView2<'_, f64>) -> f64 {
        self.forward(window, None).0
    }

    /// Layer table with output shapes and parameter counts.
    pub fn summary(&self) -> String {
        let (steps, features) = (self.steps, self.features);
        let pooled = self.pooling.output_len(steps, features);
        let sequence = format!("({}, {})", steps, features);

        let mut rows: Vec<(String, String, usize)> = vec![
            ("input".to_string(), sequence.clone(), 0),
            (
                "layer_normalization".to_string(),
                sequence.clone(),
                self.encoder.attention_norm.num_parameters(),
            ),
        ];
        for (name, projection) in self.encoder.attention.projections() {
            rows.push((
                format!("multi_head_attention/{}", name),
                format!(
                    "({}, {})",
                    steps,
                    if name == "output" {
                        features
                    } else {
                        self.encoder.attention.num_heads() * self.encoder.attention.key_dim()
                    }
                ),
                projection.num_parameters(),
            ));
        }
        rows.extend([
            (
                format!("dropout ({})", self.encoder.attention_dropout.rate()),
                sequence.clone(),
                0,
            ),
            ("residual_add".to_string(), sequence.clone(), 0),
            (
                "layer_normalization_1".to_string(),
                sequence.clone(),
                self.encoder.feed_forward_norm.num_parameters(),
            ),
            (
                "dense_relu".to_string(),
                format!("({}, {})", steps, self.encoder.feed_forward.out_features()),
                self.encoder.feed_forward.num_parameters(),
            ),
            (
                format!("dropout_1 ({})", self.encoder.feed_forward_dropout.rate()),
                sequence.clone(),
                0,
            ),
            (
                "dense_projection".to_string(),
                sequence.clone(),
                self.encoder.projection.num_parameters(),
            ),
            ("residual_add_1".to_string(), sequence, 0),
            (
                format!("global_average_pooling1d ({})", self.pooling.data_format()),
                format!("({})", pooled),
                0,
            ),
            (
                format!("dropout_2 ({})", self.head_dropout.rate()),
                format!("({})", pooled),
                0,
            ),
            (
                "dense_hidden".to_string(),
                format!("({})", self.hidden.out_features()),
                self.hidden.num_parameters(),
            ),
            (
                "dense_output".to_string(),
                format!("({})", self.output.out_features()),
                self.output.num_parameters(),
            ),
        ]);

        let mut table = String::from("Model: \"transformer_regressor\"\n");
        let _ = writeln!(table, "{:<44} {:<16} {:>10}", "Layer", "Output Shape", "Param #");
        let _ = writeln!(table, "{}", "=".repeat(72));
        for (name, shape, params) in &rows {
            let _ = writeln!(table, "{:<44} {:<16} {:>10}", name, shape, params);
        }
        let _ = writeln!(table, "{}", "=".repeat(72));
        let _ = write!(table, "Total params: {}", self.num_parameters());
        table
    }

    /// Saves the network state to a file in JSON format.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        let serialized = serde_json::to_string(self)?;
        std::fs::write(path, serialized)?;
        debug!("Saved model with {} parameters to {}", self.num_parameters(), path.display());
        Ok(())
    }

    /// Loads the network state from a JSON file.
    pub fn load_from_file(path: &std::path::Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let network = serde_json::from_str(&data)?;
        Ok(network)
    }
}

impl Parameters for TransformerRegressor {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f64>> {
        let mut params = self.encoder.parameters();
        params.extend(self.hidden.parameters());
        params.extend(self.output.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        let mut params = self.encoder.parameters_mut();
        params.extend(self.hidden.parameters_mut());
        params.extend(self.output.parameters_mut());
        params
    }
}
