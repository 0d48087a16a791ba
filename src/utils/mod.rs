// src/utils/mod.rs

pub mod data_processing;
pub mod metrics;
pub mod plotting;

pub use data_processing::{
    create_dataset,
    split_series,
    training_size,
    CsvPrices,
    Dataset,
    MinMaxScaler,
    PriceRequest,
    PriceSource,
    ScalerFit,
    YahooFinance,
};
pub use metrics::{mean_squared_error, rmse};
pub use plotting::{plot_predictions, prediction_arrays};
