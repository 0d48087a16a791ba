// src/config.rs

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{PredictorError, Result};
use crate::models::ModelConfig;
use crate::training::TrainConfig;
use crate::utils::ScalerFit;

const ENV_PREFIX: &str = "PREDICTOR_";

/// Everything one run needs, from the ticker to where the chart is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub ticker: String,
    pub start_date: NaiveDate,
    /// Exclusive.
    pub end_date: NaiveDate,
    pub window: usize,
    pub train_ratio: f64,
    pub scaler_fit: ScalerFit,
    pub model: ModelConfig,
    pub train: TrainConfig,
    pub seed: Option<u64>,
    /// Read prices from this CSV instead of downloading them.
    pub csv_path: Option<PathBuf>,
    pub output_dir: PathBuf,
    /// Save the trained weights here as JSON.
    pub model_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ticker: "TSLA".to_string(),
            start_date: NaiveDate::from_ymd_opt(2010, 6, 29).unwrap_or_default(),
            end_date: NaiveDate::from_ymd_opt(2022, 3, 25).unwrap_or_default(),
            window: 100,
            train_ratio: 0.67,
            scaler_fit: ScalerFit::FullSeries,
            model: ModelConfig::default(),
            train: TrainConfig::default(),
            seed: None,
            csv_path: None,
            output_dir: PathBuf::from("."),
            model_path: None,
        }
    }
}

impl Config {
    /// Defaults overridden by `PREDICTOR_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with a caller-supplied variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };
        let mut config = Config::default();

        if let Some(ticker) = vars.raw("TICKER") {
            config.ticker = ticker.trim().to_uppercase();
        }
        if let Some(date) = vars.raw("START_DATE") {
            config.start_date = parse_date("START_DATE", &date)?;
        }
        if let Some(date) = vars.raw("END_DATE") {
            config.end_date = parse_date("END_DATE", &date)?;
        }
        vars.set("WINDOW", &mut config.window)?;
        vars.set("TRAIN_RATIO", &mut config.train_ratio)?;
        vars.set("SCALER_FIT", &mut config.scaler_fit)?;

        vars.set("EPOCHS", &mut config.train.epochs)?;
        vars.set("BATCH_SIZE", &mut config.train.batch_size)?;
        vars.set("LEARNING_RATE", &mut config.train.learning_rate)?;
        vars.set("SHUFFLE", &mut config.train.shuffle)?;

        vars.set("HEAD_SIZE", &mut config.model.head_size)?;
        vars.set("NUM_HEADS", &mut config.model.num_heads)?;
        vars.set("FF_DIM", &mut config.model.ff_dim)?;
        vars.set("HIDDEN_UNITS", &mut config.model.hidden_units)?;
        vars.set("POOLING", &mut config.model.pooling)?;
        if let Some(rate) = vars.parse::<f64>("DROPOUT")? {
            config.model.dropout = rate;
            config.model.head_dropout = rate;
        }

        config.seed = vars.parse("SEED")?;
        config.csv_path = vars.raw("CSV_PATH").map(PathBuf::from);
        config.model_path = vars.raw("MODEL_PATH").map(PathBuf::from);
        if let Some(dir) = vars.raw("OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let key = |name: &str| format!("{}{}", ENV_PREFIX, name);

        if self.ticker.is_empty() {
            return Err(PredictorError::config(&key("TICKER"), "must not be empty"));
        }
        if self.start_date >= self.end_date {
            return Err(PredictorError::config(
                &key("END_DATE"),
                format!("{} is not after {}", self.end_date, self.start_date),
            ));
        }
        if self.window == 0 {
            return Err(PredictorError::config(&key("WINDOW"), "must be at least 1"));
        }
        if !(self.train_ratio > 0.0 && self.train_ratio < 1.0) {
            return Err(PredictorError::config(
                &key("TRAIN_RATIO"),
                "must be strictly between 0 and 1",
            ));
        }
        if self.train.epochs == 0 {
            return Err(PredictorError::config(&key("EPOCHS"), "must be at least 1"));
        }
        if self.train.batch_size == 0 {
            return Err(PredictorError::config(&key("BATCH_SIZE"), "must be at least 1"));
        }
        if !(self.train.learning_rate > 0.0 && self.train.learning_rate.is_finite()) {
            return Err(PredictorError::config(&key("LEARNING_RATE"), "must be positive"));
        }
        for (name, value) in [
            ("HEAD_SIZE", self.model.head_size),
            ("NUM_HEADS", self.model.num_heads),
            ("FF_DIM", self.model.ff_dim),
            ("HIDDEN_UNITS", self.model.hidden_units),
        ] {
            if value == 0 {
                return Err(PredictorError::config(&key(name), "must be at least 1"));
            }
        }
        for rate in [self.model.dropout, self.model.head_dropout] {
            if !(0.0..1.0).contains(&rate) {
                return Err(PredictorError::config(&key("DROPOUT"), "must be in [0, 1)"));
            }
        }
        Ok(())
    }

    /// Where the chart for this run is written.
    pub fn chart_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}_result.png", self.ticker))
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-blank value of `PREDICTOR_{name}`.
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.raw(name) {
            Some(value) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| {
                    PredictorError::config(
                        &format!("{}{}", ENV_PREFIX, name),
                        format!("'{}': {}", value, e),
                    )
                }),
            None => Ok(None),
        }
    }

    fn set<T>(&self, name: &str, target: &mut T) -> Result<()>
    where
        T: FromStr,
        T::Err: Display,
    {
        if let Some(value) = self.parse(name)? {
            *target = value;
        }
        Ok(())
    }
}

fn parse_date(name: &str, value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|e| {
        PredictorError::config(&format!("{}{}", ENV_PREFIX, name), format!("'{}': {}", value, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DataFormat;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_without_variables() {
        let config = config_from(&[]).expect("config");
        assert_eq!(config, Config::default());
        assert_eq!(config.ticker, "TSLA");
        assert_eq!(config.start_date, NaiveDate::from_ymd_opt(2010, 6, 29).unwrap());
        assert_eq!(config.end_date, NaiveDate::from_ymd_opt(2022, 3, 25).unwrap());
        assert_eq!(config.window, 100);
        assert_eq!(config.train_ratio, 0.67);
        assert_eq!(config.train.epochs, 50);
        assert_eq!(config.train.batch_size, 64);
        assert_eq!(config.chart_path(), PathBuf::from("./TSLA_result.png"));
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("PREDICTOR_TICKER", "aapl"),
            ("PREDICTOR_START_DATE", "2015-01-02"),
            ("PREDICTOR_WINDOW", "30"),
            ("PREDICTOR_TRAIN_RATIO", "0.8"),
            ("PREDICTOR_EPOCHS", "5"),
            ("PREDICTOR_SHUFFLE", "false"),
            ("PREDICTOR_SCALER_FIT", "train"),
            ("PREDICTOR_POOLING", "channels_last"),
            ("PREDICTOR_DROPOUT", "0.2"),
            ("PREDICTOR_SEED", "42"),
            ("PREDICTOR_OUTPUT_DIR", "/tmp/out"),
            ("PREDICTOR_MODEL_PATH", ""),
        ])
        .expect("config");

        assert_eq!(config.ticker, "AAPL");
        assert_eq!(config.start_date, NaiveDate::from_ymd_opt(2015, 1, 2).unwrap());
        assert_eq!(config.window, 30);
        assert_eq!(config.train_ratio, 0.8);
        assert_eq!(config.train.epochs, 5);
        assert!(!config.train.shuffle);
        assert_eq!(config.scaler_fit, ScalerFit::TrainingSegment);
        assert_eq!(config.model.pooling, DataFormat::ChannelsLast);
        assert_eq!(config.model.dropout, 0.2);
        assert_eq!(config.model.head_dropout, 0.2);
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.model_path, None);
        assert_eq!(config.chart_path(), PathBuf::from("/tmp/out/AAPL_result.png"));
    }

    #[test]
    fn test_invalid_values_name_the_variable() {
        let err = config_from(&[("PREDICTOR_WINDOW", "ten")]).unwrap_err();
        assert!(err.to_string().contains("PREDICTOR_WINDOW"), "{}", err);

        let err = config_from(&[("PREDICTOR_TRAIN_RATIO", "1.5")]).unwrap_err();
        assert!(err.to_string().contains("PREDICTOR_TRAIN_RATIO"), "{}", err);

        let err = config_from(&[("PREDICTOR_END_DATE", "2009-01-01")]).unwrap_err();
        assert!(err.to_string().contains("PREDICTOR_END_DATE"), "{}", err);

        let err = config_from(&[("PREDICTOR_POOLING", "sideways")]).unwrap_err();
        assert!(matches!(err, PredictorError::Config { .. }));
    }
}
