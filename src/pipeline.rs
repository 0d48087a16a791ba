// src/pipeline.rs

use std::fs;

use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::Config;
use crate::error::{PredictorError, Result};
use crate::models::{PriceSeries, TransformerRegressor};
use crate::training::{self, TrainingHistory};
use crate::utils::{
    create_dataset, plot_predictions, prediction_arrays, rmse, split_series, training_size,
    MinMaxScaler, PriceRequest, PriceSource, ScalerFit,
};

/// Root mean squared errors in price units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub train_rmse: f64,
    pub test_rmse: f64,
}

/// Outcome of training on one price series.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub model: TransformerRegressor,
    pub history: TrainingHistory,
    pub evaluation: Evaluation,
    /// De-normalised predictions for each training window.
    pub train_predictions: Vec<f64>,
    /// De-normalised predictions for each test window.
    pub test_predictions: Vec<f64>,
}

/// Scales, windows and splits `series`, trains a fresh model and scores it.
pub fn train_and_evaluate(config: &Config, series: &PriceSeries) -> Result<RunReport> {
    let closes = series.closes();
    if let (Some(first), Some(last)) = (series.points().first(), series.points().last()) {
        info!(
            "Loaded {} closes for {} from {} to {}",
            series.len(),
            series.ticker(),
            first.date,
            last.date
        );
    }
    let window = config.window;
    let required = window.saturating_add(1);

    let scaler = match config.scaler_fit {
        ScalerFit::FullSeries => MinMaxScaler::fit(&closes)?,
        ScalerFit::TrainingSegment => {
            let train_len = training_size(closes.len(), config.train_ratio);
            MinMaxScaler::fit(&closes[..train_len])?
        }
    };
    info!("Scaling prices from [{}, {}] to [0, 1]", scaler.min(), scaler.max());
    let scaled = scaler.transform(&closes);

    let (train_segment, test_segment) = split_series(&scaled, config.train_ratio);
    for (split, segment) in [("training", train_segment), ("test", test_segment)] {
        if segment.len() <= required {
            return Err(PredictorError::InsufficientData {
                split,
                len: segment.len(),
                window,
                required,
            });
        }
    }

    let train = create_dataset(train_segment, window);
    let test = create_dataset(test_segment, window);
    info!(
        "{} prices: {} training windows, {} test windows",
        closes.len(),
        train.len(),
        test.len()
    );

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut model = TransformerRegressor::new(&config.model, window, 1, &mut rng);
    info!("Model summary:\n{}", model.summary());

    let history = training::fit(&mut model, &train, Some(&test), &config.train, &mut rng)?;

    let train_predictions = scaler.inverse_transform(&training::predict(&model, &train).to_vec());
    let test_predictions = scaler.inverse_transform(&training::predict(&model, &test).to_vec());
    let train_targets = scaler.inverse_transform(&train.targets.to_vec());
    let test_targets = scaler.inverse_transform(&test.targets.to_vec());

    let evaluation = Evaluation {
        train_rmse: rmse(&train_predictions, &train_targets)?,
        test_rmse: rmse(&test_predictions, &test_targets)?,
    };
    info!(
        "Train RMSE {:.4}, test RMSE {:.4}",
        evaluation.train_rmse, evaluation.test_rmse
    );

    Ok(RunReport {
        model,
        history,
        evaluation,
        train_predictions,
        test_predictions,
    })
}

/// Full run: fetch, train, evaluate, optionally save the model, then write the chart.
pub fn predict_price(config: &Config, source: &dyn PriceSource) -> Result<Evaluation> {
    let request = PriceRequest::daily(config.ticker.clone(), config.start_date, config.end_date);
    let series = source.fetch_closing_prices(&request)?;

    let report = train_and_evaluate(config, &series)?;

    if let Some(path) = &config.model_path {
        report.model.save_to_file(path)?;
        info!("Saved model to {}", path.display());
    }

    let closes = series.closes();
    let (train_plot, test_plot) = prediction_arrays(
        closes.len(),
        config.window,
        &report.train_predictions,
        &report.test_predictions,
    );
    fs::create_dir_all(&config.output_dir)?;
    plot_predictions(
        &config.chart_path(),
        &config.ticker,
        &closes,
        &train_plot,
        &test_plot,
    )?;

    Ok(report.evaluation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DataFormat, ModelConfig, PricePoint};
    use crate::training::TrainConfig;
    use chrono::{Duration, NaiveDate};
    use std::cell::RefCell;

    /// Serves a fixed series and remembers the last request.
    struct StaticPrices {
        closes: Vec<f64>,
        last_request: RefCell<Option<PriceRequest>>,
    }

    impl StaticPrices {
        fn new(closes: Vec<f64>) -> Self {
            StaticPrices {
                closes,
                last_request: RefCell::new(None),
            }
        }
    }

    impl PriceSource for StaticPrices {
        fn fetch_closing_prices(&self, request: &PriceRequest) -> Result<PriceSeries> {
            *self.last_request.borrow_mut() = Some(request.clone());
            Ok(series(&request.ticker, &self.closes))
        }
    }

    fn series(ticker: &str, closes: &[f64]) -> PriceSeries {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let points = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| PricePoint {
                date: start + Duration::days(i as i64),
                close,
            })
            .collect();
        PriceSeries::new(ticker, points)
    }

    fn small_config() -> Config {
        Config {
            window: 10,
            train_ratio: 0.67,
            model: ModelConfig {
                head_size: 4,
                num_heads: 2,
                ff_dim: 4,
                dropout: 0.1,
                hidden_units: 8,
                head_dropout: 0.1,
                pooling: DataFormat::ChannelsFirst,
            },
            train: TrainConfig {
                epochs: 3,
                batch_size: 16,
                learning_rate: 0.001,
                shuffle: true,
            },
            seed: Some(7),
            ..Config::default()
        }
    }

    #[test]
    fn test_linear_ramp_trains_with_finite_loss() {
        let closes: Vec<f64> = (1..=200).map(|v| v as f64).collect();
        let report = train_and_evaluate(&small_config(), &series("RAMP", &closes)).expect("run");

        // 134 training prices and 66 test prices with window 10.
        assert_eq!(report.train_predictions.len(), 123);
        assert_eq!(report.test_predictions.len(), 55);
        assert_eq!(report.history.loss.len(), 3);
        assert!(report.history.loss.iter().all(|l| l.is_finite()));
        assert!(report.evaluation.train_rmse.is_finite());
        assert!(report.evaluation.test_rmse.is_finite());
    }

    #[test]
    fn test_training_segment_scaler_still_runs() {
        let closes: Vec<f64> = (1..=200).map(|v| v as f64).collect();
        let config = Config {
            scaler_fit: ScalerFit::TrainingSegment,
            ..small_config()
        };
        let report = train_and_evaluate(&config, &series("RAMP", &closes)).expect("run");
        assert!(report.evaluation.test_rmse.is_finite());
    }

    #[test]
    fn test_constant_series_is_rejected() {
        let closes = vec![42.0; 200];
        let err = train_and_evaluate(&small_config(), &series("FLAT", &closes)).unwrap_err();
        assert!(matches!(err, PredictorError::DegenerateScale(_)), "{}", err);
    }

    #[test]
    fn test_short_series_is_rejected() {
        // 30 prices split 20/10; the test segment cannot hold a window of 10 plus a target.
        let closes: Vec<f64> = (1..=30).map(|v| v as f64).collect();
        let err = train_and_evaluate(&small_config(), &series("SHORT", &closes)).unwrap_err();
        match err {
            PredictorError::InsufficientData { split, len, window, .. } => {
                assert_eq!(split, "test");
                assert_eq!(len, 10);
                assert_eq!(window, 10);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_oversized_window_is_rejected_without_overflow() {
        let closes: Vec<f64> = (1..=200).map(|v| v as f64).collect();
        let config = Config {
            window: usize::MAX,
            ..small_config()
        };
        let err = train_and_evaluate(&config, &series("RAMP", &closes)).unwrap_err();
        match err {
            PredictorError::InsufficientData { split, required, .. } => {
                assert_eq!(split, "training");
                assert_eq!(required, usize::MAX);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_predict_price_writes_chart_and_model() {
        let dir = tempfile::tempdir().expect("tempdir");
        let model_path = dir.path().join("model.json");
        let config = Config {
            ticker: "RAMP".to_string(),
            output_dir: dir.path().join("charts"),
            model_path: Some(model_path.clone()),
            ..small_config()
        };
        let source = StaticPrices::new((1..=200).map(|v| v as f64).collect());

        let evaluation = predict_price(&config, &source).expect("run");
        assert!(evaluation.train_rmse.is_finite());
        assert!(evaluation.test_rmse.is_finite());

        let request = source.last_request.borrow().clone().expect("request");
        assert_eq!(request.ticker, "RAMP");
        assert_eq!(request.start, config.start_date);
        assert_eq!(request.end, config.end_date);

        let chart = config.chart_path();
        assert_eq!(chart, dir.path().join("charts").join("RAMP_result.png"));
        let size = std::fs::metadata(&chart).expect("chart written").len();
        assert!(size > 0);

        let model = TransformerRegressor::load_from_file(&model_path).expect("load");
        assert_eq!(model.steps(), 10);
    }

    #[test]
    fn test_model_is_saved_before_chart_is_drawn() {
        let dir = tempfile::tempdir().expect("tempdir");
        let model_path = dir.path().join("model.json");
        // A regular file where the output directory should be makes the chart step fail.
        let blocked = dir.path().join("not_a_dir");
        std::fs::write(&blocked, b"").expect("write");
        let config = Config {
            output_dir: blocked,
            model_path: Some(model_path.clone()),
            ..small_config()
        };
        let source = StaticPrices::new((1..=200).map(|v| v as f64).collect());

        assert!(predict_price(&config, &source).is_err());
        assert!(model_path.is_file());
    }
}
