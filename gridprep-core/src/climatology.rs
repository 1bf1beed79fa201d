//! Monthly climatologies for the anomaly path.
//!
//! A climatology is the per-calendar-month mean field computed strictly from
//! a designated subset of dates, never from the full range. Subtracting it
//! from a variable yields the anomaly representation. When the data spans
//! months the climatology does not cover, a single scalar mean is subtracted
//! instead as a degraded fallback.

use crate::cache::FsCache;
use crate::cube::DataCube;
use crate::errors::{ProcResult, ProcessingError};
use crate::frequency::TimeStamp;
use log::{info, warn};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Per-calendar-month mean fields for one variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Climatology {
    #[serde(with = "nan_fields")]
    months: BTreeMap<u32, Array2<f64>>,
}

/// JSON has no NaN literal, so month fields are persisted with non-finite
/// cells as nulls and restored as NaN.
mod nan_fields {
    use ndarray::Array2;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    type Packed = BTreeMap<u32, ((usize, usize), Vec<Option<f64>>)>;

    pub fn serialize<S: Serializer>(
        fields: &BTreeMap<u32, Array2<f64>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let packed: Packed = fields
            .iter()
            .map(|(month, field)| {
                let shape = (field.shape()[0], field.shape()[1]);
                let values = field.iter().map(|v| v.is_finite().then_some(*v)).collect();
                (*month, (shape, values))
            })
            .collect();
        packed.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<u32, Array2<f64>>, D::Error> {
        let packed = Packed::deserialize(deserializer)?;
        packed
            .into_iter()
            .map(|(month, (shape, values))| {
                let values: Vec<f64> = values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect();
                Array2::from_shape_vec(shape, values)
                    .map(|field| (month, field))
                    .map_err(D::Error::custom)
            })
            .collect()
    }
}

impl Climatology {
    /// Build from the samples at `clim_dates` in `cube`.
    pub fn from_cube(cube: &DataCube, clim_dates: &[TimeStamp]) -> ProcResult<Self> {
        let samples = cube.select_times(clim_dates);
        if samples.is_empty() {
            return Err(ProcessingError::Configuration(
                "no climatology dates intersect the loaded data".to_string(),
            ));
        }
        Ok(Self {
            months: samples.monthly_mean(),
        })
    }

    pub fn months(&self) -> BTreeSet<u32> {
        self.months.keys().copied().collect()
    }

    pub fn field(&self, month: u32) -> Option<&Array2<f64>> {
        self.months.get(&month)
    }

    /// Mean of the climatology across all months and cells, ignoring NaNs.
    pub fn overall_mean(&self) -> f64 {
        let (sum, n) = self
            .months
            .values()
            .flat_map(|field| field.iter())
            .filter(|v| v.is_finite())
            .fold((0.0, 0u64), |(s, n), v| (s + v, n + 1));
        if n > 0 {
            sum / n as f64
        } else {
            f64::NAN
        }
    }

    /// Turn `cube` into anomalies in place.
    ///
    /// Per-month fields are subtracted when the data's months are a subset of
    /// the climatology's; otherwise the overall scalar mean is subtracted and
    /// a warning is emitted.
    pub fn apply_anomaly(&self, cube: &mut DataCube) {
        let data_months = cube.months_present();
        let clim_months = self.months();
        if data_months.is_subset(&clim_months) {
            cube.subtract_monthly(&self.months);
        } else {
            warn!(
                "Incomplete climatology (months {:?}) compared with data (months {:?})",
                clim_months, data_months
            );
            cube.subtract_scalar(self.overall_mean());
        }
    }

    pub fn load(path: &Path) -> ProcResult<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> ProcResult<()> {
        fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }
}

/// Persists and retrieves per-variable climatologies.
#[derive(Debug, Clone)]
pub struct ClimatologyStore {
    cache: FsCache,
}

impl ClimatologyStore {
    pub fn new(output_dir: impl Into<PathBuf>, reference_dir: Option<PathBuf>) -> Self {
        Self {
            cache: FsCache::new(output_dir).with_reference(reference_dir),
        }
    }

    fn key(var_name: &str) -> String {
        format!("params/climatology.{}", var_name)
    }

    /// Load the persisted climatology for `var_name`, or compute it from
    /// `clim_dates` and persist it under the local output directory. A
    /// configured reference directory is consulted first but never written.
    pub fn get_or_build(
        &self,
        var_name: &str,
        cube: &DataCube,
        clim_dates: &[TimeStamp],
    ) -> ProcResult<Climatology> {
        let key = Self::key(var_name);

        if let Some(path) = self.cache.find(&key) {
            info!("Reusing climatology {}", path.display());
            return Climatology::load(&path);
        }

        if clim_dates.is_empty() {
            return Err(ProcessingError::Configuration(format!(
                "no climatology persisted for {} and no dates supplied for generation",
                var_name
            )));
        }

        let climatology = Climatology::from_cube(cube, clim_dates)?;
        let path = self.cache.write_path(&key)?;
        info!("Generating climatology {}", path.display());
        climatology.save(&path)?;
        Ok(climatology)
    }
}
