//! Per-variable normalisation with statistics fixed from a reference split.
//!
//! Two interchangeable strategies are supported: mean/standard-deviation and
//! min/max scaling. Statistics are computed once over the ravelled samples at
//! the normalisation-split dates and persisted as two comma-joined scalars;
//! a persisted stat file is authoritative and never recomputed.

use crate::cache::FsCache;
use crate::cube::DataCube;
use crate::errors::{ProcResult, ProcessingError};
use crate::frequency::TimeStamp;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How a variable's values are rescaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormaliseStrategy {
    /// `(x - mean) / std`
    MeanStd,
    /// `(x - min) / (max - min)`
    MinMax,
}

impl NormaliseStrategy {
    /// Folder the stat files for this strategy live under.
    pub fn folder(&self) -> &'static str {
        match self {
            NormaliseStrategy::MeanStd => "normalisation.mean",
            NormaliseStrategy::MinMax => "normalisation.scale",
        }
    }
}

/// Computes, caches and applies normalisation statistics.
#[derive(Debug, Clone)]
pub struct Normaliser {
    strategy: NormaliseStrategy,
    cache: FsCache,
}

impl Normaliser {
    pub fn new(
        strategy: NormaliseStrategy,
        output_dir: impl Into<PathBuf>,
        reference_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            strategy,
            cache: FsCache::new(output_dir).with_reference(reference_dir),
        }
    }

    pub fn strategy(&self) -> NormaliseStrategy {
        self.strategy
    }

    fn key(&self, var_name: &str) -> String {
        format!("{}/{}", self.strategy.folder(), var_name)
    }

    /// The two statistics for `var_name`: a persisted pair verbatim if one
    /// exists, otherwise a pair computed from the samples at `norm_dates`
    /// and persisted (unless reading against a reference directory).
    pub fn statistics(
        &self,
        var_name: &str,
        cube: &DataCube,
        norm_dates: &[TimeStamp],
    ) -> ProcResult<(f64, f64)> {
        let key = self.key(var_name);

        if let Some(text) = self.cache.get(&key) {
            debug!("Loading normalisation statistics from cache for {}", var_name);
            return parse_pair(&text);
        }

        if norm_dates.is_empty() {
            return Err(ProcessingError::Configuration(format!(
                "either a normalisation file or normalisation split dates must be supplied for {}",
                var_name
            )));
        }

        debug!(
            "Generating normalisation statistics from {} dates for {}",
            norm_dates.len(),
            var_name
        );
        let samples = cube.select_times(norm_dates);
        let pair = match self.strategy {
            NormaliseStrategy::MeanStd => {
                let (mean, std) = (samples.nan_mean(), samples.nan_std());
                info!("Mean: {:.3}, std: {:.3}", mean, std);
                (mean, std)
            }
            NormaliseStrategy::MinMax => {
                let (min, max) = (samples.nan_min(), samples.nan_max());
                info!("Min: {:.3}, max: {:.3}", min, max);
                (min, max)
            }
        };

        self.cache.put(&key, &format!("{},{}", pair.0, pair.1))?;
        Ok(pair)
    }

    /// Rescale `cube` in place using the statistics for `var_name`.
    pub fn normalise(
        &self,
        var_name: &str,
        cube: &mut DataCube,
        norm_dates: &[TimeStamp],
    ) -> ProcResult<()> {
        let (a, b) = self.statistics(var_name, cube, norm_dates)?;
        match self.strategy {
            NormaliseStrategy::MeanStd => cube.apply(|v| (v - a) / b),
            NormaliseStrategy::MinMax => cube.apply(|v| (v - a) / (b - a)),
        }
        Ok(())
    }
}

fn parse_pair(text: &str) -> ProcResult<(f64, f64)> {
    let mut values = text.trim().split(',').map(str::parse::<f64>);
    match (values.next(), values.next(), values.next()) {
        (Some(Ok(a)), Some(Ok(b)), None) => Ok((a, b)),
        _ => Err(ProcessingError::Error(format!(
            "malformed normalisation statistics: {:?}",
            text
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use is_close::is_close;
    use ndarray::Array3;

    fn ts(d: u32) -> TimeStamp {
        NaiveDate::from_ymd_opt(2000, 1, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn cube(values: Vec<f64>) -> DataCube {
        let times = (1..=values.len() as u32).map(ts).collect();
        let data = Array3::from_shape_vec((values.len(), 1, 1), values).unwrap();
        DataCube::new(times, data).unwrap()
    }

    #[test]
    fn mean_std_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let norm = Normaliser::new(NormaliseStrategy::MeanStd, dir.path(), None);
        let mut c = cube(vec![1.0, 2.0, 3.0]);
        let dates: Vec<_> = c.times().to_vec();

        let (mean, std) = norm.statistics("tas", &c, &dates).unwrap();
        norm.normalise("tas", &mut c, &dates).unwrap();

        // Inverse recovers the original value within tolerance
        let recovered = c.slab(0)[[0, 0]] * std + mean;
        assert!(is_close!(recovered, 1.0));
    }

    #[test]
    fn min_max_scales_to_unit_interval() {
        let dir = tempfile::tempdir().unwrap();
        let norm = Normaliser::new(NormaliseStrategy::MinMax, dir.path(), None);
        let mut c = cube(vec![2.0, 4.0, 6.0]);
        let dates: Vec<_> = c.times().to_vec();
        norm.normalise("tas", &mut c, &dates).unwrap();
        assert!(is_close!(c.slab(0)[[0, 0]], 0.0));
        assert!(is_close!(c.slab(1)[[0, 0]], 0.5));
        assert!(is_close!(c.slab(2)[[0, 0]], 1.0));
    }

    #[test]
    fn persisted_statistics_are_authoritative() {
        let dir = tempfile::tempdir().unwrap();
        let stat_dir = dir.path().join("normalisation.mean");
        std::fs::create_dir_all(&stat_dir).unwrap();
        std::fs::write(stat_dir.join("tas"), "10,2").unwrap();

        let norm = Normaliser::new(NormaliseStrategy::MeanStd, dir.path(), None);
        let c = cube(vec![1.0, 2.0, 3.0]);
        // No dates supplied; the cached file must be used verbatim
        let (mean, std) = norm.statistics("tas", &c, &[]).unwrap();
        assert_eq!((mean, std), (10.0, 2.0));
    }

    #[test]
    fn second_run_does_not_rewrite_the_stat_file() {
        let dir = tempfile::tempdir().unwrap();
        let norm = Normaliser::new(NormaliseStrategy::MinMax, dir.path(), None);
        let c = cube(vec![1.0, 2.0, 3.0]);
        let dates: Vec<_> = c.times().to_vec();

        norm.statistics("tas", &c, &dates).unwrap();
        let path = dir.path().join("normalisation.scale").join("tas");
        let first = std::fs::read(&path).unwrap();

        // Different data, same variable: the persisted pair wins
        let other = cube(vec![100.0, 200.0]);
        let (min, max) = norm.statistics("tas", &other, &dates).unwrap();
        assert_eq!((min, max), (1.0, 3.0));
        assert_eq!(std::fs::read(&path).unwrap(), first);
    }

    #[test]
    fn no_cache_and_no_dates_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let norm = Normaliser::new(NormaliseStrategy::MeanStd, dir.path(), None);
        let c = cube(vec![1.0]);
        let result = norm.statistics("tas", &c, &[]);
        assert!(matches!(result, Err(ProcessingError::Configuration(_))));
    }

    #[test]
    fn reference_directory_is_used_but_not_written() {
        let refdir = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let norm = Normaliser::new(
            NormaliseStrategy::MeanStd,
            local.path(),
            Some(refdir.path().to_path_buf()),
        );
        let c = cube(vec![1.0, 2.0, 3.0]);
        let dates: Vec<_> = c.times().to_vec();

        let (mean, _) = norm.statistics("tas", &c, &dates).unwrap();
        assert!(is_close!(mean, 2.0));
        assert!(!refdir.path().join("normalisation.mean").exists());
        assert!(!local.path().join("normalisation.mean").exists());
    }

    #[test]
    fn statistics_ignore_nan_samples() {
        let dir = tempfile::tempdir().unwrap();
        let norm = Normaliser::new(NormaliseStrategy::MinMax, dir.path(), None);
        let c = cube(vec![1.0, f64::NAN, 3.0]);
        let dates: Vec<_> = c.times().to_vec();
        let (min, max) = norm.statistics("tas", &c, &dates).unwrap();
        assert_eq!((min, max), (1.0, 3.0));
    }
}
