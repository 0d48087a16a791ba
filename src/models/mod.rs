// src/models/mod.rs

pub mod attention;
pub mod layers;
pub mod network;
pub mod optimizer;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One trading day's closing price.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub close: f64,
}

/// Daily closing prices for one ticker, ascending by date.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PriceSeries {
    ticker: String,
    points: Vec<PricePoint>,
}

impl PriceSeries {
    /// Sorts `points` by date; later duplicates of a date are dropped.
    pub fn new(ticker: impl Into<String>, mut points: Vec<PricePoint>) -> Self {
        points.sort_by_key(|p| p.date);
        points.dedup_by_key(|p| p.date);
        PriceSeries {
            ticker: ticker.into(),
            points,
        }
    }

    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    pub fn points(&self) -> &[PricePoint] {
        &self.points
    }

    pub fn closes(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.close).collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

// Re-export network components
pub use layers::{DataFormat, Parameters};
pub use network::{ModelConfig, TransformerRegressor};
pub use optimizer::Adam;

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 3, d).expect("valid date")
    }

    #[test]
    fn test_series_is_sorted_and_deduplicated() {
        let series = PriceSeries::new(
            "TSLA",
            vec![
                PricePoint { date: day(3), close: 3.0 },
                PricePoint { date: day(1), close: 1.0 },
                PricePoint { date: day(2), close: 2.0 },
                PricePoint { date: day(1), close: 9.0 },
            ],
        );
        assert_eq!(series.ticker(), "TSLA");
        assert_eq!(series.len(), 3);
        let dates: Vec<_> = series.points().iter().map(|p| p.date).collect();
        assert_eq!(dates, vec![day(1), day(2), day(3)]);
        assert_eq!(series.closes()[1..], [2.0, 3.0]);
    }
}
