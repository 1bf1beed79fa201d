//! Machine-readable record of a processing run.
//!
//! The manifest captures the processor configuration, the resolved source
//! index and the registry of produced files. It is the contract consumed by
//! downstream loader-configuration builders and is written only once a run
//! has fully completed.

use crate::errors::ProcResult;
use crate::frequency::TimeStamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Split name → final (post-extension) date set.
pub type Splits = BTreeMap<String, Vec<TimeStamp>>;

/// Split name → variable name → resolved source files.
pub type SourceIndex = BTreeMap<String, BTreeMap<String, Vec<PathBuf>>>;

/// Artifact name → output files written for it, in production order.
pub type ProcessedFiles = BTreeMap<String, Vec<PathBuf>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub implementation: String,
    pub absolute_vars: Vec<String>,
    pub anomaly_vars: Vec<String>,
    pub dataset_config: String,
    pub lag_time: u32,
    pub lead_time: u32,
    pub linear_trends: Vec<String>,
    pub linear_trend_steps: Vec<u32>,
    pub path: PathBuf,
    pub processed_files: ProcessedFiles,
    pub source_files: SourceIndex,
    pub splits: Splits,
}

impl Manifest {
    pub fn save(&self, path: &Path) -> ProcResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> ProcResult<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}
