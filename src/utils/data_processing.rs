// src/utils/data_processing.rs

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime};
use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use reqwest::blocking::Client;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{PredictorError, Result};
use crate::models::{PricePoint, PriceSeries};

const YAHOO_BASE_URL: &str = "https://query1.finance.yahoo.com";
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36";

/// What to download: one ticker, `[start, end)`, at a fixed sampling interval.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceRequest {
    pub ticker: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub interval: String,
}

impl PriceRequest {
    pub fn daily(ticker: impl Into<String>, start: NaiveDate, end: NaiveDate) -> Self {
        PriceRequest {
            ticker: ticker.into(),
            start,
            end,
            interval: "1d".to_string(),
        }
    }

    fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date < self.end
    }
}

/// Anything that can produce a closing-price history.
pub trait PriceSource {
    fn fetch_closing_prices(&self, request: &PriceRequest) -> Result<PriceSeries>;
}

// Yahoo Finance chart API response
#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    #[serde(default)]
    meta: ChartMeta,
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
}

#[derive(Debug, Default, Deserialize)]
struct ChartMeta {
    /// Exchange offset from UTC in seconds.
    #[serde(default)]
    gmtoffset: i64,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<Quote>,
}

#[derive(Debug, Deserialize)]
struct Quote {
    #[serde(default)]
    close: Vec<Option<f64>>,
}

/// Daily closes from the Yahoo Finance chart endpoint.
pub struct YahooFinance {
    base_url: Url,
    client: Client,
}

impl YahooFinance {
    pub fn new() -> Result<Self> {
        Self::with_base_url(YAHOO_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| PredictorError::Provider(format!("invalid base URL {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(PredictorError::Provider(format!(
                "base URL {} cannot hold a path",
                base_url
            )));
        }
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(YahooFinance { base_url, client })
    }

    /// Chart endpoint for `request`; the ticker is escaped as one path segment.
    fn chart_url(&self, request: &PriceRequest) -> Url {
        let period1 = request.start.and_time(NaiveTime::MIN).and_utc().timestamp();
        let period2 = request.end.and_time(NaiveTime::MIN).and_utc().timestamp();

        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["v8", "finance", "chart", request.ticker.as_str()]);
        }
        url.query_pairs_mut()
            .append_pair("period1", &period1.to_string())
            .append_pair("period2", &period2.to_string())
            .append_pair("interval", &request.interval)
            .append_pair("events", "history");
        url
    }
}

impl PriceSource for YahooFinance {
    fn fetch_closing_prices(&self, request: &PriceRequest) -> Result<PriceSeries> {
        let url = self.chart_url(request);
        info!("Fetching {} prices from {}", request.ticker, url);

        let response: ChartResponse = self.client.get(url).send()?.json()?;
        let points = parse_chart(response, request)?;
        let series = PriceSeries::new(request.ticker.clone(), points);
        if series.is_empty() {
            return Err(PredictorError::EmptySeries {
                ticker: request.ticker.clone(),
            });
        }

        info!("Fetched {} closing prices for {}", series.len(), request.ticker);
        Ok(series)
    }
}

fn parse_chart(response: ChartResponse, request: &PriceRequest) -> Result<Vec<PricePoint>> {
    if let Some(error) = response.chart.error {
        return Err(PredictorError::Provider(format!(
            "{}: {}",
            error.code, error.description
        )));
    }

    let data = response
        .chart
        .result
        .and_then(|results| results.into_iter().next())
        .ok_or_else(|| PredictorError::Provider("response contains no chart data".to_string()))?;
    let quote = data
        .indicators
        .quote
        .into_iter()
        .next()
        .ok_or_else(|| PredictorError::Provider("response contains no quotes".to_string()))?;

    // Timestamps mark the session open; shifting by the exchange offset
    // keeps each row on its local trading day.
    let offset = data.meta.gmtoffset;
    let mut points = Vec::with_capacity(data.timestamp.len());
    let mut skipped = 0;
    for (i, &ts) in data.timestamp.iter().enumerate() {
        let close = quote.close.get(i).copied().flatten();
        let date =
            DateTime::from_timestamp(ts.saturating_add(offset), 0).map(|dt| dt.date_naive());
        match (date, close) {
            (Some(date), Some(close)) if request.contains(date) => {
                points.push(PricePoint { date, close });
            }
            (Some(_), Some(_)) => {}
            _ => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!("Skipped {} rows without a closing price", skipped);
    }
    Ok(points)
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(rename = "Date", alias = "date")]
    date: String,
    #[serde(rename = "Close", alias = "close")]
    close: Option<f64>,
}

/// Closing prices from a local `Date,Close` CSV file, such as a saved download.
pub struct CsvPrices {
    path: PathBuf,
}

impl CsvPrices {
    pub fn new(path: impl AsRef<Path>) -> Self {
        CsvPrices {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl PriceSource for CsvPrices {
    fn fetch_closing_prices(&self, request: &PriceRequest) -> Result<PriceSeries> {
        info!("Reading {} prices from {}", request.ticker, self.path.display());
        let mut reader = csv::Reader::from_path(&self.path)?;

        let mut points = Vec::new();
        for row in reader.deserialize() {
            let row: CsvRow = row?;
            // Accept both "2010-06-29" and "2010-06-29 00:00:00-04:00".
            let day = row.date.get(..10).unwrap_or(&row.date);
            let date = NaiveDate::parse_from_str(day, "%Y-%m-%d")?;
            match row.close {
                Some(close) if request.contains(date) => points.push(PricePoint { date, close }),
                Some(_) => {}
                None => debug!("No close for {}", date),
            }
        }

        let series = PriceSeries::new(request.ticker.clone(), points);
        if series.is_empty() {
            return Err(PredictorError::EmptySeries {
                ticker: request.ticker.clone(),
            });
        }
        Ok(series)
    }
}

/// Linear map of observed `[min, max]` onto `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    min: f64,
    max: f64,
}

impl MinMaxScaler {
    /// Rejects empty, non-finite and constant input, where the map is undefined.
    pub fn fit(values: &[f64]) -> Result<Self> {
        if values.is_empty() {
            return Err(PredictorError::DegenerateScale("series is empty".to_string()));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(PredictorError::DegenerateScale(
                "series contains non-finite values".to_string(),
            ));
        }
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if max == min {
            return Err(PredictorError::DegenerateScale(format!(
                "all {} values equal {}",
                values.len(),
                min
            )));
        }
        Ok(MinMaxScaler { min, max })
    }

    pub fn fit_transform(values: &[f64]) -> Result<(Self, Vec<f64>)> {
        let scaler = Self::fit(values)?;
        let scaled = scaler.transform(values);
        Ok((scaler, scaled))
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn transform_value(&self, value: f64) -> f64 {
        (value - self.min) / (self.max - self.min)
    }

    pub fn inverse_transform_value(&self, value: f64) -> f64 {
        value * (self.max - self.min) + self.min
    }

    pub fn transform(&self, values: &[f64]) -> Vec<f64> {
        values.iter().map(|&v| self.transform_value(v)).collect()
    }

    pub fn inverse_transform(&self, values: &[f64]) -> Vec<f64> {
        values.iter().map(|&v| self.inverse_transform_value(v)).collect()
    }
}

/// Which slice of the series the scaler is fitted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalerFit {
    /// The whole series, including the test period.
    FullSeries,
    /// Only the leading training segment.
    TrainingSegment,
}

impl FromStr for ScalerFit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" | "full_series" => Ok(ScalerFit::FullSeries),
            "train" | "training" | "training_segment" => Ok(ScalerFit::TrainingSegment),
            other => Err(format!("unknown scaler fit '{}', expected full or train", other)),
        }
    }
}

/// Windows (one per row) and the value that follows each window.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub inputs: Array2<f64>,
    pub targets: Array1<f64>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn window_size(&self) -> usize {
        self.inputs.ncols()
    }

    /// Row `index` shaped `(window, 1)` for a single-feature model.
    pub fn sample(&self, index: usize) -> ArrayView2<'_, f64> {
        self.inputs.row(index).insert_axis(Axis(1))
    }
}

/// Slides a window of `window` values over `series` with stride 1.
///
/// Yields `len - window - 1` samples (none when the series is too short);
/// the final value of the series is never used as a target.
pub fn create_dataset(series: &[f64], window: usize) -> Dataset {
    let count = series.len().saturating_sub(window.saturating_add(1));
    let inputs = Array2::from_shape_fn((count, window), |(i, j)| series[i + j]);
    let targets = Array1::from_shape_fn(count, |i| series[i + window]);
    debug!("Built {} windows of length {}", count, window);
    Dataset { inputs, targets }
}

/// Number of leading values assigned to training, truncated toward zero.
pub fn training_size(len: usize, ratio: f64) -> usize {
    ((len as f64 * ratio) as usize).min(len)
}

/// Positional split into a leading training prefix and the trailing rest.
pub fn split_series(series: &[f64], ratio: f64) -> (&[f64], &[f64]) {
    series.split_at(training_size(series.len(), ratio))
}
