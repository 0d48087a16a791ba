// src/utils/plotting.rs

use std::path::Path;

use log::info;
use plotters::prelude::*;

use crate::error::{PredictorError, Result};

/// 12 x 6 inches at 300 DPI.
const CHART_SIZE: (u32, u32) = (3600, 1800);

const ACTUAL_COLOR: RGBColor = RGBColor(31, 119, 180);
const TRAIN_COLOR: RGBColor = RGBColor(255, 127, 14);
const TEST_COLOR: RGBColor = RGBColor(44, 160, 44);

/// Places predictions back on the time axis of a series of `series_len` values.
///
/// Training predictions start at `window`; test predictions start at
/// `train.len() + 2 * window + 1`. Every other slot is `NaN`, and values
/// that would land past the end of the series are dropped.
pub fn prediction_arrays(
    series_len: usize,
    window: usize,
    train: &[f64],
    test: &[f64],
) -> (Vec<f64>, Vec<f64>) {
    let mut train_plot = vec![f64::NAN; series_len];
    for (slot, value) in train_plot.iter_mut().skip(window).zip(train) {
        *slot = *value;
    }

    let mut test_plot = vec![f64::NAN; series_len];
    let offset = train
        .len()
        .saturating_add(window.saturating_mul(2))
        .saturating_add(1);
    for (slot, value) in test_plot.iter_mut().skip(offset).zip(test) {
        *slot = *value;
    }

    (train_plot, test_plot)
}

/// Contiguous runs of plottable points; NaN and non-positive values break a run.
fn segments(values: &[f64]) -> Vec<Vec<(usize, f64)>> {
    let mut runs = Vec::new();
    let mut current = Vec::new();
    for (i, &v) in values.iter().enumerate() {
        if v.is_finite() && v > 0.0 {
            current.push((i, v));
        } else if !current.is_empty() {
            runs.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

fn value_range(series: &[&[f64]]) -> Option<(f64, f64)> {
    let mut values = series
        .iter()
        .flat_map(|s| s.iter().copied())
        .filter(|v| v.is_finite() && *v > 0.0)
        .peekable();
    values.peek()?;
    let (min, max) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if (max - min).abs() < f64::EPSILON {
        Some((min * 0.9, max * 1.1))
    } else {
        Some((min, max))
    }
}

fn plot_error<E: std::fmt::Display>(e: E) -> PredictorError {
    PredictorError::Plot(e.to_string())
}

/// Draws actual prices and both prediction arrays on a log-scaled chart.
pub fn plot_predictions(
    path: &Path,
    ticker: &str,
    actual: &[f64],
    train_plot: &[f64],
    test_plot: &[f64],
) -> Result<()> {
    let (min, max) = value_range(&[actual, train_plot, test_plot])
        .ok_or_else(|| PredictorError::Plot("no positive prices to plot".to_string()))?;

    let root = BitMapBackend::new(path, CHART_SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(plot_error)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(
            format!("Stock Price Prediction using Transformer {}", ticker),
            ("sans-serif", 64),
        )
        .margin(40)
        .x_label_area_size(120)
        .y_label_area_size(180)
        .build_cartesian_2d(0..actual.len().max(1), (min..max).log_scale())
        .map_err(plot_error)?;

    chart
        .configure_mesh()
        .x_desc("Time")
        .y_desc("Stock Price")
        .label_style(("sans-serif", 36))
        .axis_desc_style(("sans-serif", 44))
        .draw()
        .map_err(plot_error)?;

    for (values, color, label) in [
        (actual, ACTUAL_COLOR, "Actual Stock Price"),
        (train_plot, TRAIN_COLOR, "Train Predict"),
        (test_plot, TEST_COLOR, "Test Predict"),
    ] {
        let mut labelled = false;
        for run in segments(values) {
            let mut anno = chart
                .draw_series(LineSeries::new(run, color.stroke_width(3)))
                .map_err(plot_error)?;
            if !labelled {
                anno.label(label).legend(move |(x, y)| {
                    PathElement::new(vec![(x, y), (x + 40, y)], color.stroke_width(3))
                });
                labelled = true;
            }
        }
    }

    chart
        .configure_series_labels()
        .label_font(("sans-serif", 36))
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .position(SeriesLabelPosition::UpperLeft)
        .draw()
        .map_err(plot_error)?;

    root.present().map_err(plot_error)?;
    info!("Saved chart to {}", path.display());
    Ok(())
}
