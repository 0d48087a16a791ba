// src/main.rs

use anyhow::Context;
use env_logger::Env;
use log::info;

use price_transformer::utils::{CsvPrices, PriceSource, YahooFinance};
use price_transformer::{predict_price, Config};

fn main() -> anyhow::Result<()> {
    // Initialize environment variables
    dotenv::dotenv().ok();

    // Initialize the logger
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = Config::from_env().context("failed to load configuration")?;
    info!(
        "Predicting {} closes from {} to {} with window {}",
        config.ticker, config.start_date, config.end_date, config.window
    );

    let source: Box<dyn PriceSource> = match &config.csv_path {
        Some(path) => Box::new(CsvPrices::new(path)),
        None => Box::new(YahooFinance::new().context("failed to build HTTP client")?),
    };

    let evaluation = predict_price(&config, source.as_ref())
        .with_context(|| format!("prediction run for {} failed", config.ticker))?;

    println!("Train RMSE: {}", evaluation.train_rmse);
    println!("Test RMSE: {}", evaluation.test_rmse);
    Ok(())
}
