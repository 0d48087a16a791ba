// src/models/layers.rs

//! Building blocks for the encoder: dense projections, layer normalisation,
//! dropout and global average pooling.
//!
//! Every layer works on one sample at a time, laid out as a
//! `(steps, features)` matrix. `forward` returns the output together with a
//! cache holding whatever `backward` needs; `backward` adds parameter
//! gradients into a zeroed copy of the layer and returns the gradient with
//! respect to the layer input.

use std::fmt;
use std::str::FromStr;

use ndarray::{Array, Array1, Array2, ArrayViewD, ArrayViewMutD, Axis, Dimension, Zip};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Trainable tensors of a layer or a whole network.
///
/// The order of `parameters` and `parameters_mut` must match, which lets the
/// optimizer and gradient accumulation pair tensors positionally.
pub trait Parameters {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f64>>;

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>>;

    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }

    /// Copy of `self` with every trainable value set to zero, used as a
    /// gradient accumulator.
    fn zeros_like(&self) -> Self
    where
        Self: Clone + Sized,
    {
        let mut zeros = self.clone();
        for mut p in zeros.parameters_mut() {
            p.fill(0.0);
        }
        zeros
    }

    fn accumulate(&mut self, other: &Self)
    where
        Self: Sized,
    {
        for (mut p, o) in self.parameters_mut().into_iter().zip(other.parameters()) {
            p += &o;
        }
    }
}

/// Glorot (Xavier) uniform initialisation.
pub fn glorot_uniform<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Array2<f64> {
    let limit = (6.0 / (rows + cols).max(1) as f64).sqrt();
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-limit..=limit))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Linear,
    Relu,
}

impl Activation {
    fn apply(self, values: &mut Array2<f64>) {
        if self == Activation::Relu {
            values.mapv_inplace(relu);
        }
    }

    fn backward(self, output: &Array2<f64>, grad_output: &Array2<f64>) -> Array2<f64> {
        let mut grad = grad_output.clone();
        if self == Activation::Relu {
            Zip::from(&mut grad).and(output).for_each(|g, &o| {
                if o <= 0.0 {
                    *g = 0.0;
                }
            });
        }
        grad
    }
}

fn relu(x: f64) -> f64 {
    if x > 0.0 { x } else { 0.0 }
}

/// Fully connected layer applied row-wise: `y = act(xW + b)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dense {
    weights: Array2<f64>,
    bias: Array1<f64>,
    activation: Activation,
}

#[derive(Debug, Clone)]
pub struct DenseCache {
    input: Array2<f64>,
    output: Array2<f64>,
}

impl DenseCache {
    pub fn output(&self) -> &Array2<f64> {
        &self.output
    }
}

impl Dense {
    /// Glorot-uniform weights, zero bias.
    pub fn new<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        Dense {
            weights: glorot_uniform(in_features, out_features, rng),
            bias: Array1::zeros(out_features),
            activation,
        }
    }

    pub fn in_features(&self) -> usize {
        self.weights.nrows()
    }

    pub fn out_features(&self) -> usize {
        self.weights.ncols()
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn forward(&self, input: &Array2<f64>) -> (Array2<f64>, DenseCache) {
        let mut output = input.dot(&self.weights) + &self.bias;
        self.activation.apply(&mut output);
        let cache = DenseCache {
            input: input.clone(),
            output: output.clone(),
        };
        (output, cache)
    }

    pub fn backward(
        &self,
        cache: &DenseCache,
        grad_output: &Array2<f64>,
        grads: &mut Dense,
    ) -> Array2<f64> {
        let grad = self.activation.backward(&cache.output, grad_output);
        grads.weights += &cache.input.t().dot(&grad);
        grads.bias += &grad.sum_axis(Axis(0));
        grad.dot(&self.weights.t())
    }
}

impl Parameters for Dense {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f64>> {
        vec![self.weights.view().into_dyn(), self.bias.view().into_dyn()]
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        vec![
            self.weights.view_mut().into_dyn(),
            self.bias.view_mut().into_dyn(),
        ]
    }
}

/// Layer normalisation over the feature axis of each row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerNorm {
    gamma: Array1<f64>,
    beta: Array1<f64>,
    epsilon: f64,
}

#[derive(Debug, Clone)]
pub struct LayerNormCache {
    normalized: Array2<f64>,
    inv_std: Array1<f64>,
}

impl LayerNorm {
    pub fn new(features: usize, epsilon: f64) -> Self {
        LayerNorm {
            gamma: Array1::ones(features),
            beta: Array1::zeros(features),
            epsilon,
        }
    }

    pub fn forward(&self, input: &Array2<f64>) -> (Array2<f64>, LayerNormCache) {
        let n = input.ncols().max(1) as f64;
        let mean = (input.sum_axis(Axis(1)) / n).insert_axis(Axis(1));
        let centered = input - &mean;
        let variance = centered.mapv(|v| v * v).sum_axis(Axis(1)) / n;
        let inv_std = variance.mapv(|v| 1.0 / (v + self.epsilon).sqrt());
        let normalized = &centered * &inv_std.view().insert_axis(Axis(1));
        let output = &normalized * &self.gamma + &self.beta;
        (output, LayerNormCache { normalized, inv_std })
    }

    pub fn backward(
        &self,
        cache: &LayerNormCache,
        grad_output: &Array2<f64>,
        grads: &mut LayerNorm,
    ) -> Array2<f64> {
        let n = grad_output.ncols().max(1) as f64;
        grads.gamma += &(grad_output * &cache.normalized).sum_axis(Axis(0));
        grads.beta += &grad_output.sum_axis(Axis(0));

        let d_norm = grad_output * &self.gamma;
        let sum_d = d_norm.sum_axis(Axis(1)).insert_axis(Axis(1));
        let sum_dx = (&d_norm * &cache.normalized)
            .sum_axis(Axis(1))
            .insert_axis(Axis(1));
        let inv_std = cache.inv_std.view().insert_axis(Axis(1));

        let mut grad = &d_norm * n;
        grad -= &sum_d;
        grad -= &(&cache.normalized * &sum_dx);
        grad *= &inv_std;
        grad / n
    }
}

impl Parameters for LayerNorm {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f64>> {
        vec![self.gamma.view().into_dyn(), self.beta.view().into_dyn()]
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        vec![self.gamma.view_mut().into_dyn(), self.beta.view_mut().into_dyn()]
    }
}

/// Inverted dropout. Active only when a random source is supplied.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Dropout {
    rate: f64,
}

impl Dropout {
    pub fn new(rate: f64) -> Self {
        Dropout { rate }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Returns the output and, in training mode, the scaling mask that was applied.
    pub fn forward<D: Dimension>(
        &self,
        input: &Array<f64, D>,
        rng: Option<&mut StdRng>,
    ) -> (Array<f64, D>, Option<Array<f64, D>>) {
        match rng {
            Some(rng) if self.rate > 0.0 => {
                let scale = 1.0 / (1.0 - self.rate);
                let rate = self.rate;
                let mask = input.map(|_| if rng.gen::<f64>() < rate { 0.0 } else { scale });
                let mut output = input.clone();
                output *= &mask;
                (output, Some(mask))
            }
            _ => (input.clone(), None),
        }
    }

    pub fn backward<D: Dimension>(
        &self,
        mask: Option<&Array<f64, D>>,
        grad_output: &Array<f64, D>,
    ) -> Array<f64, D> {
        let mut grad = grad_output.clone();
        if let Some(mask) = mask {
            grad *= mask;
        }
        grad
    }
}

/// Which axis of a `(steps, features)` sample is treated as channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataFormat {
    /// The first axis holds channels; pooling averages over the second.
    ChannelsFirst,
    /// The last axis holds channels; pooling averages over time.
    ChannelsLast,
}

impl FromStr for DataFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "channels_first" => Ok(DataFormat::ChannelsFirst),
            "channels_last" => Ok(DataFormat::ChannelsLast),
            other => Err(format!(
                "unknown data format '{}', expected channels_first or channels_last",
                other
            )),
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataFormat::ChannelsFirst => write!(f, "channels_first"),
            DataFormat::ChannelsLast => write!(f, "channels_last"),
        }
    }
}

/// Averages a `(steps, features)` sample down to a single row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GlobalAveragePooling1D {
    data_format: DataFormat,
}

impl GlobalAveragePooling1D {
    pub fn new(data_format: DataFormat) -> Self {
        GlobalAveragePooling1D { data_format }
    }

    pub fn data_format(&self) -> DataFormat {
        self.data_format
    }

    pub fn output_len(&self, steps: usize, features: usize) -> usize {
        match self.data_format {
            DataFormat::ChannelsFirst => steps,
            DataFormat::ChannelsLast => features,
        }
    }

    /// Output has shape `(1, output_len)`.
    pub fn forward(&self, input: &Array2<f64>) -> Array2<f64> {
        let (steps, features) = input.dim();
        let pooled = match self.data_format {
            DataFormat::ChannelsFirst => input.sum_axis(Axis(1)) / features.max(1) as f64,
            DataFormat::ChannelsLast => input.sum_axis(Axis(0)) / steps.max(1) as f64,
        };
        pooled.insert_axis(Axis(0))
    }

    pub fn backward(&self, input_dim: (usize, usize), grad_output: &Array2<f64>) -> Array2<f64> {
        let (steps, features) = input_dim;
        match self.data_format {
            DataFormat::ChannelsFirst => {
                let count = features.max(1) as f64;
                Array2::from_shape_fn(input_dim, |(t, _)| grad_output[[0, t]] / count)
            }
            DataFormat::ChannelsLast => {
                let count = steps.max(1) as f64;
                Array2::from_shape_fn(input_dim, |(_, c)| grad_output[[0, c]] / count)
            }
        }
    }
}
