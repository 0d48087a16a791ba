// src/lib.rs

pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod training;
pub mod utils;

pub use config::Config;
pub use error::{PredictorError, Result};
pub use pipeline::{predict_price, train_and_evaluate, Evaluation, RunReport};
