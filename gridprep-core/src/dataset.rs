//! Source dataset collaborator.
//!
//! The pipeline consumes its inputs through [`DatasetConfig`]: a description
//! of the dataset's time resolution, the variables it carries, and how a
//! (variable, date) pair maps to a concrete file. [`DirectoryDataset`] is a
//! plain filesystem implementation of that surface.

use crate::frequency::{Frequency, TimeStamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// A variable carried by a source dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableConfig {
    pub name: String,
}

impl VariableConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Surface exposed by a source dataset configuration.
pub trait DatasetConfig: Send + Sync {
    /// Short name identifying this dataset in artifacts and manifests.
    fn identifier(&self) -> &str;

    /// Time resolution of the dataset.
    fn frequency(&self) -> Frequency;

    /// Variables declared by the dataset, in a stable order.
    fn variables(&self) -> &[VariableConfig];

    /// File holding `var` at `date`.
    fn var_filepath(&self, var: &VariableConfig, date: TimeStamp) -> PathBuf;

    /// Sorted, de-duplicated files covering `dates` for `var`.
    fn var_filepaths(&self, var: &VariableConfig, dates: &[TimeStamp]) -> Vec<PathBuf> {
        let paths: BTreeSet<PathBuf> = dates
            .iter()
            .map(|&date| self.var_filepath(var, date))
            .collect();
        paths.into_iter().collect()
    }

    /// Reference to the dataset's own configuration, recorded in manifests.
    fn config_ref(&self) -> String;
}

/// Dataset laid out as `<root>/<variable>/<variable>_<date label>.<ext>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryDataset {
    identifier: String,
    root: PathBuf,
    frequency: Frequency,
    variables: Vec<VariableConfig>,
    extension: String,
}

impl DirectoryDataset {
    pub fn new(
        identifier: impl Into<String>,
        root: impl Into<PathBuf>,
        frequency: Frequency,
        variables: Vec<VariableConfig>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            root: root.into(),
            frequency,
            variables,
            extension: extension.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl DatasetConfig for DirectoryDataset {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn frequency(&self) -> Frequency {
        self.frequency
    }

    fn variables(&self) -> &[VariableConfig] {
        &self.variables
    }

    fn var_filepath(&self, var: &VariableConfig, date: TimeStamp) -> PathBuf {
        self.root.join(&var.name).join(format!(
            "{}_{}.{}",
            var.name,
            self.frequency.label(date),
            self.extension
        ))
    }

    fn config_ref(&self) -> String {
        format!("{}:{}", self.identifier, self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(y: i32, m: u32, d: u32) -> TimeStamp {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn dataset() -> DirectoryDataset {
        DirectoryDataset::new(
            "osisaf",
            "/data/osisaf",
            Frequency::Day,
            vec![VariableConfig::new("siconca")],
            "json",
        )
    }

    #[test]
    fn filepath_uses_frequency_label() {
        let ds = dataset();
        let var = &ds.variables()[0];
        assert_eq!(
            ds.var_filepath(var, ts(2000, 1, 2)),
            PathBuf::from("/data/osisaf/siconca/siconca_2000-01-02.json")
        );
    }

    #[test]
    fn filepaths_are_sorted_and_unique() {
        let ds = dataset();
        let var = ds.variables()[0].clone();
        let paths = ds.var_filepaths(&var, &[ts(2000, 1, 2), ts(2000, 1, 1), ts(2000, 1, 2)]);
        assert_eq!(paths.len(), 2);
        assert!(paths[0] < paths[1]);
    }
}
