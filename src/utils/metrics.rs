// src/utils/metrics.rs

use crate::error::{PredictorError, Result};

/// Mean of squared differences between paired values.
pub fn mean_squared_error(predictions: &[f64], targets: &[f64]) -> Result<f64> {
    if predictions.len() != targets.len() {
        return Err(PredictorError::LengthMismatch {
            expected: targets.len(),
            actual: predictions.len(),
        });
    }
    if targets.is_empty() {
        return Err(PredictorError::LengthMismatch {
            expected: 1,
            actual: 0,
        });
    }
    let mse = predictions
        .iter()
        .zip(targets)
        .map(|(pred, target)| (pred - target).powi(2))
        .sum::<f64>()
        / predictions.len() as f64;
    Ok(mse)
}

pub fn rmse(predictions: &[f64], targets: &[f64]) -> Result<f64> {
    mean_squared_error(predictions, targets).map(f64::sqrt)
}
