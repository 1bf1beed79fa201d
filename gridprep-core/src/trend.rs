//! Linear-trend forecasting with an incrementally grown cache.
//!
//! For trend-eligible variables a forecast field is produced at each
//! configured step ahead of every input date, by fitting a per-cell linear
//! trend to historical samples sharing the target's calendar month and day
//! (with a one-day tolerance to absorb leap-year offsets).
//!
//! Forecast fields are expensive, so they are cached in a sparse time-indexed
//! cube that only ever grows: new target dates are appended across runs and
//! existing non-missing entries are never overwritten.

use crate::cube::{CubeStore, DataCube};
use crate::errors::{ProcResult, ProcessingError};
use crate::frequency::{Frequency, TimeStamp};
use chrono::Datelike;
use log::info;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Forecast step offsets, either a count expanded to `1..=n` or an explicit
/// list of offsets in frequency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendSteps {
    Count(u32),
    Explicit(Vec<u32>),
}

impl TrendSteps {
    pub fn resolve(&self) -> Vec<u32> {
        match self {
            TrendSteps::Count(n) => (1..=*n).collect(),
            TrendSteps::Explicit(steps) => steps.clone(),
        }
    }
}

impl Default for TrendSteps {
    fn default() -> Self {
        TrendSteps::Count(7)
    }
}

/// Configuration for trend forecasting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendConfig {
    pub steps: TrendSteps,
    /// Cap on the number of most recent historical samples fitted per target.
    pub max_years: usize,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            steps: TrendSteps::default(),
            max_years: 35,
        }
    }
}

/// The union of `date + step` over all input dates and configured steps.
pub fn forecast_targets(
    input_times: &[TimeStamp],
    steps: &[u32],
    frequency: Frequency,
) -> Vec<TimeStamp> {
    let targets: BTreeSet<TimeStamp> = input_times
        .iter()
        .flat_map(|&t| {
            steps
                .iter()
                .map(move |&s| frequency.offset(t, i64::from(s)))
        })
        .collect();
    targets.into_iter().collect()
}

/// Fit a least-squares line to `points` and evaluate it at `x0`.
///
/// An empty sample set yields NaN; a single sample or a degenerate abscissa
/// falls back to the sample mean.
pub fn fit_and_extrapolate(points: &[(f64, f64)], x0: f64) -> f64 {
    let n = points.len() as f64;
    if points.is_empty() {
        return f64::NAN;
    }
    let sx: f64 = points.iter().map(|(x, _)| x).sum();
    let sy: f64 = points.iter().map(|(_, y)| y).sum();
    if points.len() == 1 {
        return sy;
    }
    let sxx: f64 = points.iter().map(|(x, _)| x * x).sum();
    let sxy: f64 = points.iter().map(|(x, y)| x * y).sum();

    let denominator = n * sxx - sx * sx;
    if denominator.abs() < f64::EPSILON {
        return sy / n;
    }
    let slope = (n * sxy - sx * sy) / denominator;
    let intercept = (sy - slope * sx) / n;
    slope * x0 + intercept
}

/// Indices into `reference` of historical samples usable for `target`:
/// matching calendar month, matching day or the day before (leap-year
/// tolerance), at or before the target, not globally missing, capped to the
/// most recent `max_years` occurrences.
fn select_samples(
    reference: &DataCube,
    target: TimeStamp,
    missing_dates: &BTreeSet<TimeStamp>,
    max_years: usize,
) -> Vec<usize> {
    let selected: Vec<usize> = reference
        .times()
        .iter()
        .enumerate()
        .filter(|(_, t)| {
            t.month() == target.month()
                && (t.day() == target.day() || t.day() + 1 == target.day())
                && **t <= target
                && !missing_dates.contains(t)
        })
        .map(|(i, _)| i)
        .collect();
    let skip = selected.len().saturating_sub(max_years);
    selected.into_iter().skip(skip).collect()
}

/// Per-cell linear extrapolation of the selected samples to `target`.
fn forecast_field(reference: &DataCube, sample_indices: &[usize], target: TimeStamp) -> Array2<f64> {
    let (rows, cols) = reference.grid_shape();
    let x0 = f64::from(target.year());
    let mut field = Array2::from_elem((rows, cols), f64::NAN);
    for r in 0..rows {
        for c in 0..cols {
            let points: Vec<(f64, f64)> = sample_indices
                .iter()
                .map(|&i| (f64::from(reference.times()[i].year()), reference.slab(i)[[r, c]]))
                .filter(|(_, y)| y.is_finite())
                .collect();
            field[[r, c]] = fit_and_extrapolate(&points, x0);
        }
    }
    field
}

/// Build (or grow) the linear-trend forecast cube for one variable.
///
/// `input` drives the target dates, `reference` supplies the historical
/// samples. The artifact at `cache_path` doubles as the incremental cache:
/// entries already holding data are reused verbatim and only missing targets
/// are computed, most recent first. The merged cube is persisted back and
/// returned.
pub fn build_linear_trend(
    input: &DataCube,
    reference: &DataCube,
    var_name: &str,
    config: &TrendConfig,
    frequency: Frequency,
    missing_dates: &[TimeStamp],
    store: &dyn CubeStore,
    cache_path: &Path,
) -> ProcResult<DataCube> {
    if frequency == Frequency::Hour {
        return Err(ProcessingError::Configuration(
            "hour-based linear trends are not supported".to_string(),
        ));
    }

    let steps = config.steps.resolve();
    let targets = forecast_targets(input.times(), &steps, frequency);
    info!(
        "Generating trend data up to {} steps ahead for {} dates of {}",
        steps.iter().max().copied().unwrap_or(0),
        input.len(),
        var_name
    );

    let cached = if cache_path.exists() {
        let cube = store.read(cache_path)?;
        info!(
            "Loaded {} entries from {}",
            cube.len(),
            cache_path.display()
        );
        Some(cube)
    } else {
        None
    };

    let mut all_times: BTreeSet<TimeStamp> = targets.iter().copied().collect();
    if let Some(cube) = &cached {
        all_times.extend(cube.times().iter().copied());
    }
    let mut merged = DataCube::filled_nan(all_times.into_iter().collect(), reference.grid_shape())?;
    if let Some(cube) = &cached {
        if cube.grid_shape() != reference.grid_shape() {
            return Err(ProcessingError::ShapeMismatch {
                expected: reference.grid_shape(),
                got: cube.grid_shape(),
            });
        }
        for (i, t) in cube.times().iter().enumerate() {
            if let Some(j) = merged.time_index(*t) {
                merged.slab_mut(j).assign(&cube.slab(i));
            }
        }
    }

    let missing: BTreeSet<TimeStamp> = missing_dates.iter().copied().collect();
    for &target in targets.iter().rev() {
        let index = merged
            .time_index(target)
            .ok_or_else(|| ProcessingError::Error(format!("{} missing from trend axis", target)))?;
        if merged.slab(index).iter().any(|v| v.is_finite()) {
            continue;
        }
        let samples = select_samples(reference, target, &missing, config.max_years);
        let field = forecast_field(reference, &samples, target);
        merged.slab_mut(index).assign(&field);
    }

    info!("Writing new trend cache for {}", var_name);
    store.write(cache_path, &merged)?;
    Ok(merged)
}
