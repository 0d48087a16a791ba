// src/error.rs

use thiserror::Error;

/// Errors raised anywhere between fetching prices and writing the chart.
#[derive(Debug, Error)]
pub enum PredictorError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("price provider error: {0}")]
    Provider(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid date: {0}")]
    Date(#[from] chrono::ParseError),

    #[error("invalid configuration for {key}: {message}")]
    Config { key: String, message: String },

    #[error("no prices returned for {ticker}")]
    EmptySeries { ticker: String },

    #[error("cannot scale series: {0}")]
    DegenerateScale(String),

    #[error("{split} split has {len} prices, need more than {required} for window {window}")]
    InsufficientData {
        split: &'static str,
        len: usize,
        window: usize,
        required: usize,
    },

    #[error("length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("training diverged at epoch {epoch}: loss is {loss}")]
    Diverged { epoch: usize, loss: f64 },

    #[error("plotting failed: {0}")]
    Plot(String),
}

pub type Result<T> = std::result::Result<T, PredictorError>;

impl PredictorError {
    pub(crate) fn config(key: &str, message: impl Into<String>) -> Self {
        PredictorError::Config {
            key: key.to_string(),
            message: message.into(),
        }
    }
}
