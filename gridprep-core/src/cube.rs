//! Time-labelled spatial arrays and the persistence seam for them.
//!
//! A [`DataCube`] is the in-memory unit the pipeline works on: a stack of
//! 2D fields with one calendar label per slab. Missing values are NaN and
//! every reduction here ignores them.
//!
//! Persistence goes through the narrow [`CubeStore`] trait so the pipeline
//! never depends on a particular array engine. [`JsonCubeStore`] is the
//! bundled implementation and is sufficient for caches, processed artifacts
//! and tests.

use crate::errors::{ProcResult, ProcessingError};
use crate::frequency::TimeStamp;
use chrono::Datelike;
use log::debug;
use ndarray::{Array2, Array3, ArrayView2, ArrayViewMut2, Axis, Zip};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// A stack of 2D spatial fields with one timestamp per slab.
///
/// Invariant: `times.len() == data.shape()[0]` and times are unique and
/// chronologically sorted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataCube {
    times: Vec<TimeStamp>,
    #[serde(with = "nan_array")]
    data: Array3<f64>,
}

/// JSON has no NaN literal, so cubes are persisted with non-finite cells as
/// nulls and restored as NaN.
mod nan_array {
    use ndarray::Array3;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Packed {
        shape: (usize, usize, usize),
        values: Vec<Option<f64>>,
    }

    pub fn serialize<S: Serializer>(data: &Array3<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        let dims = data.shape();
        Packed {
            shape: (dims[0], dims[1], dims[2]),
            values: data.iter().map(|v| v.is_finite().then_some(*v)).collect(),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Array3<f64>, D::Error> {
        let packed = Packed::deserialize(deserializer)?;
        let values: Vec<f64> = packed
            .values
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect();
        Array3::from_shape_vec(packed.shape, values).map_err(D::Error::custom)
    }
}

impl DataCube {
    pub fn new(times: Vec<TimeStamp>, data: Array3<f64>) -> ProcResult<Self> {
        if times.len() != data.shape()[0] {
            return Err(ProcessingError::Error(format!(
                "{} time labels for {} slabs",
                times.len(),
                data.shape()[0]
            )));
        }
        if times.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ProcessingError::Error(
                "time labels must be unique and sorted".to_string(),
            ));
        }
        Ok(Self { times, data })
    }

    /// An all-NaN cube over the given times.
    pub fn filled_nan(times: Vec<TimeStamp>, shape: (usize, usize)) -> ProcResult<Self> {
        let data = Array3::from_elem((times.len(), shape.0, shape.1), f64::NAN);
        Self::new(times, data)
    }

    pub fn times(&self) -> &[TimeStamp] {
        &self.times
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Shape of a single spatial field as (rows, cols).
    pub fn grid_shape(&self) -> (usize, usize) {
        (self.data.shape()[1], self.data.shape()[2])
    }

    pub fn time_index(&self, t: TimeStamp) -> Option<usize> {
        self.times.binary_search(&t).ok()
    }

    pub fn slab(&self, index: usize) -> ArrayView2<'_, f64> {
        self.data.index_axis(Axis(0), index)
    }

    pub fn slab_mut(&mut self, index: usize) -> ArrayViewMut2<'_, f64> {
        self.data.index_axis_mut(Axis(0), index)
    }

    /// New cube restricted to the requested times that are actually present.
    pub fn select_times(&self, requested: &[TimeStamp]) -> Self {
        let wanted: BTreeSet<TimeStamp> = requested.iter().copied().collect();
        let indices: Vec<usize> = self
            .times
            .iter()
            .enumerate()
            .filter(|(_, t)| wanted.contains(t))
            .map(|(i, _)| i)
            .collect();
        let times = indices.iter().map(|&i| self.times[i]).collect();
        let data = self.data.select(Axis(0), &indices);
        Self { times, data }
    }

    /// Calendar months (1-12) present in the time labels.
    pub fn months_present(&self) -> BTreeSet<u32> {
        self.times.iter().map(|t| t.month()).collect()
    }

    /// Per-cell mean field for each calendar month present, ignoring NaNs.
    pub fn monthly_mean(&self) -> BTreeMap<u32, Array2<f64>> {
        let shape = self.grid_shape();
        let mut acc: BTreeMap<u32, (Array2<f64>, Array2<f64>)> = BTreeMap::new();
        for (i, t) in self.times.iter().enumerate() {
            let (sum, count) = acc
                .entry(t.month())
                .or_insert_with(|| (Array2::zeros(shape), Array2::zeros(shape)));
            Zip::from(sum)
                .and(count)
                .and(&self.slab(i))
                .for_each(|s, n, &v| {
                    if v.is_finite() {
                        *s += v;
                        *n += 1.0;
                    }
                });
        }
        acc.into_iter()
            .map(|(month, (sum, count))| {
                let mean = Zip::from(&sum)
                    .and(&count)
                    .map_collect(|&s, &n| if n > 0.0 { s / n } else { f64::NAN });
                (month, mean)
            })
            .collect()
    }

    fn finite(&self) -> impl Iterator<Item = f64> + '_ {
        self.data.iter().copied().filter(|v| v.is_finite())
    }

    pub fn nan_mean(&self) -> f64 {
        let (sum, n) = self.finite().fold((0.0, 0u64), |(s, n), v| (s + v, n + 1));
        if n > 0 {
            sum / n as f64
        } else {
            f64::NAN
        }
    }

    /// Population standard deviation, ignoring NaNs.
    pub fn nan_std(&self) -> f64 {
        let mean = self.nan_mean();
        let (sq, n) = self
            .finite()
            .fold((0.0, 0u64), |(s, n), v| (s + (v - mean).powi(2), n + 1));
        if n > 0 {
            (sq / n as f64).sqrt()
        } else {
            f64::NAN
        }
    }

    pub fn nan_min(&self) -> f64 {
        self.finite().fold(f64::NAN, f64::min)
    }

    pub fn nan_max(&self) -> f64 {
        self.finite().fold(f64::NAN, f64::max)
    }

    /// Apply `f` to every value in place.
    pub fn apply<F: Fn(f64) -> f64>(&mut self, f: F) {
        self.data.mapv_inplace(f);
    }

    pub fn subtract_scalar(&mut self, value: f64) {
        self.apply(|v| v - value);
    }

    /// Subtract the field matching each slab's calendar month.
    /// Slabs whose month has no entry are left untouched.
    pub fn subtract_monthly(&mut self, fields: &BTreeMap<u32, Array2<f64>>) {
        for i in 0..self.len() {
            let month = self.times[i].month();
            if let Some(field) = fields.get(&month) {
                let mut slab = self.data.index_axis_mut(Axis(0), i);
                slab -= field;
            }
        }
    }

    /// Merge cubes into one, sorted by time. The first slab seen for a
    /// timestamp wins.
    pub fn concat(cubes: Vec<DataCube>) -> ProcResult<Self> {
        let mut slabs: BTreeMap<TimeStamp, Array2<f64>> = BTreeMap::new();
        let mut shape: Option<(usize, usize)> = None;
        for cube in cubes {
            match shape {
                None => shape = Some(cube.grid_shape()),
                Some(expected) if expected != cube.grid_shape() => {
                    return Err(ProcessingError::ShapeMismatch {
                        expected,
                        got: cube.grid_shape(),
                    });
                }
                _ => {}
            }
            for (i, t) in cube.times.iter().enumerate() {
                slabs.entry(*t).or_insert_with(|| cube.slab(i).to_owned());
            }
        }
        let shape =
            shape.ok_or_else(|| ProcessingError::Error("no cubes to concatenate".to_string()))?;
        let times: Vec<TimeStamp> = slabs.keys().copied().collect();
        let mut data = Array3::zeros((times.len(), shape.0, shape.1));
        for (i, slab) in slabs.values().enumerate() {
            data.index_axis_mut(Axis(0), i).assign(slab);
        }
        Self::new(times, data)
    }
}

/// Narrow persistence capability for cubes.
///
/// The production array engine lives behind this trait; the pipeline only
/// needs whole-cube reads and writes plus a multi-file open.
pub trait CubeStore: Send + Sync {
    fn read(&self, path: &Path) -> ProcResult<DataCube>;

    fn write(&self, path: &Path, cube: &DataCube) -> ProcResult<()>;

    /// File extension used for artifacts produced through this store.
    fn extension(&self) -> &'static str;

    /// Open many files and merge them along the time axis.
    ///
    /// With `parallel` set the opens fan out over a thread pool; all reads
    /// join before this returns, so ordering and values are unaffected.
    fn read_many(&self, paths: &[PathBuf], parallel: bool) -> ProcResult<DataCube> {
        let cubes: ProcResult<Vec<DataCube>> = if parallel {
            paths.par_iter().map(|p| self.read(p)).collect()
        } else {
            paths.iter().map(|p| self.read(p)).collect()
        };
        DataCube::concat(cubes?)
    }
}

/// JSON-backed cube persistence.
#[derive(Debug, Default, Clone)]
pub struct JsonCubeStore;

impl CubeStore for JsonCubeStore {
    fn read(&self, path: &Path) -> ProcResult<DataCube> {
        debug!("Reading cube from {}", path.display());
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn write(&self, path: &Path, cube: &DataCube) -> ProcResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        debug!("Writing cube to {}", path.display());
        fs::write(path, serde_json::to_string(cube)?)?;
        Ok(())
    }

    fn extension(&self) -> &'static str {
        "json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use is_close::is_close;
    use ndarray::array;

    fn ts(y: i32, m: u32, d: u32) -> TimeStamp {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn cube(times: Vec<TimeStamp>, values: Vec<f64>) -> DataCube {
        let n = times.len();
        let data = Array3::from_shape_vec((n, 1, 1), values).unwrap();
        DataCube::new(times, data).unwrap()
    }

    #[test]
    fn rejects_unsorted_times() {
        let data = Array3::zeros((2, 1, 1));
        let result = DataCube::new(vec![ts(2000, 1, 2), ts(2000, 1, 1)], data);
        assert!(result.is_err());
    }

    #[test]
    fn select_times_keeps_present_subset() {
        let c = cube(
            vec![ts(2000, 1, 1), ts(2000, 1, 2), ts(2000, 1, 3)],
            vec![1.0, 2.0, 3.0],
        );
        let selected = c.select_times(&[ts(2000, 1, 3), ts(2000, 1, 1), ts(2000, 2, 1)]);
        assert_eq!(selected.times(), &[ts(2000, 1, 1), ts(2000, 1, 3)]);
        assert_eq!(selected.slab(1)[[0, 0]], 3.0);
    }

    #[test]
    fn nan_statistics_ignore_missing() {
        let c = cube(
            vec![ts(2000, 1, 1), ts(2000, 1, 2), ts(2000, 1, 3)],
            vec![1.0, f64::NAN, 3.0],
        );
        assert!(is_close!(c.nan_mean(), 2.0));
        assert!(is_close!(c.nan_std(), 1.0));
        assert!(is_close!(c.nan_min(), 1.0));
        assert!(is_close!(c.nan_max(), 3.0));
    }

    #[test]
    fn monthly_mean_groups_by_calendar_month() {
        let c = cube(
            vec![
                ts(2000, 1, 1),
                ts(2000, 1, 2),
                ts(2000, 2, 1),
                ts(2001, 1, 1),
            ],
            vec![1.0, 3.0, 10.0, 5.0],
        );
        let means = c.monthly_mean();
        assert_eq!(means.len(), 2);
        assert!(is_close!(means[&1][[0, 0]], 3.0));
        assert!(is_close!(means[&2][[0, 0]], 10.0));
    }

    #[test]
    fn monthly_mean_skips_nan_cells() {
        let c = cube(
            vec![ts(2000, 1, 1), ts(2001, 1, 1)],
            vec![f64::NAN, 4.0],
        );
        let means = c.monthly_mean();
        assert!(is_close!(means[&1][[0, 0]], 4.0));
    }

    #[test]
    fn subtract_monthly_matches_slab_months() {
        let mut c = cube(
            vec![ts(2000, 1, 1), ts(2000, 2, 1)],
            vec![5.0, 5.0],
        );
        let mut fields = BTreeMap::new();
        fields.insert(1, array![[1.0]]);
        fields.insert(2, array![[2.0]]);
        c.subtract_monthly(&fields);
        assert!(is_close!(c.slab(0)[[0, 0]], 4.0));
        assert!(is_close!(c.slab(1)[[0, 0]], 3.0));
    }

    #[test]
    fn concat_sorts_and_deduplicates() {
        let a = cube(vec![ts(2000, 1, 2)], vec![2.0]);
        let b = cube(vec![ts(2000, 1, 1), ts(2000, 1, 2)], vec![1.0, 99.0]);
        let merged = DataCube::concat(vec![a, b]).unwrap();
        assert_eq!(merged.times(), &[ts(2000, 1, 1), ts(2000, 1, 2)]);
        // First slab seen for a timestamp wins
        assert_eq!(merged.slab(1)[[0, 0]], 2.0);
    }

    #[test]
    fn concat_rejects_mismatched_grids() {
        let a = cube(vec![ts(2000, 1, 1)], vec![1.0]);
        let data = Array3::zeros((1, 2, 2));
        let b = DataCube::new(vec![ts(2000, 1, 2)], data).unwrap();
        assert!(DataCube::concat(vec![a, b]).is_err());
    }

    #[test]
    fn json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tas").join("tas_2000-01-01.json");
        let store = JsonCubeStore;
        let c = cube(vec![ts(2000, 1, 1)], vec![1.5]);
        store.write(&path, &c).unwrap();
        let loaded = store.read(&path).unwrap();
        assert_eq!(loaded, c);
    }

    #[test]
    fn read_many_merges_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCubeStore;
        let p1 = dir.path().join("a.json");
        let p2 = dir.path().join("b.json");
        store.write(&p1, &cube(vec![ts(2000, 1, 2)], vec![2.0])).unwrap();
        store.write(&p2, &cube(vec![ts(2000, 1, 1)], vec![1.0])).unwrap();
        for parallel in [false, true] {
            let merged = store
                .read_many(&[p1.clone(), p2.clone()], parallel)
                .unwrap();
            assert_eq!(merged.times(), &[ts(2000, 1, 1), ts(2000, 1, 2)]);
        }
    }
}
