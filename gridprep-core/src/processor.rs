//! Channel processing orchestration.
//!
//! [`ChannelProcessor`] drives the whole pipeline for each configured
//! variable and representation: lazy multi-file load, climatology
//! subtraction for anomalies, the pre-normalisation hook, linear-trend
//! forecasting, normalisation, the post-normalisation hook, and persistence
//! of the output artifact. A single control thread walks the
//! variable × representation loop; only the multi-file open may fan out.
//!
//! Configuration errors abort the run before the manifest is written, so a
//! failed run never leaves a manifest describing partial outputs.

use crate::calendar::extend_split;
use crate::climatology::ClimatologyStore;
use crate::cube::{CubeStore, DataCube, JsonCubeStore};
use crate::dataset::DatasetConfig;
use crate::errors::{ProcResult, ProcessingError};
use crate::frequency::TimeStamp;
use crate::manifest::{Manifest, ProcessedFiles, SourceIndex, Splits};
use crate::normalise::{NormaliseStrategy, Normaliser};
use crate::trend::{build_linear_trend, TrendConfig};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

const IMPLEMENTATION: &str = "gridprep-core:ChannelProcessor";

/// Hooks applied around normalisation for each channel.
///
/// Concrete pipelines override these to inject dataset-specific adjustments;
/// the defaults are the identity.
pub trait ChannelTransform: Send + Sync {
    fn pre_normalisation(&self, var_name: &str, _cube: &mut DataCube) -> ProcResult<()> {
        debug!("No pre normalisation implemented for {}", var_name);
        Ok(())
    }

    fn post_normalisation(&self, var_name: &str, _cube: &mut DataCube) -> ProcResult<()> {
        debug!("No post normalisation implemented for {}", var_name);
        Ok(())
    }
}

/// The default, hook-free transform.
#[derive(Debug, Default, Clone)]
pub struct IdentityTransform;

impl ChannelTransform for IdentityTransform {}

/// Builder for [`ChannelProcessor`].
pub struct ChannelProcessorBuilder {
    dataset: Option<Arc<dyn DatasetConfig>>,
    output_dir: Option<PathBuf>,
    identifier: Option<String>,
    splits: Splits,
    absolute_vars: Vec<String>,
    anomaly_vars: Vec<String>,
    anom_clim_splits: Vec<String>,
    normalisation_splits: Vec<String>,
    strategy: NormaliseStrategy,
    lag_time: u32,
    lead_time: u32,
    linear_trends: Vec<String>,
    trend: TrendConfig,
    no_normalise: Vec<String>,
    parallel_opens: bool,
    reference_dir: Option<PathBuf>,
    store: Arc<dyn CubeStore>,
    transform: Arc<dyn ChannelTransform>,
}

impl Default for ChannelProcessorBuilder {
    fn default() -> Self {
        Self {
            dataset: None,
            output_dir: None,
            identifier: None,
            splits: Splits::new(),
            absolute_vars: vec![],
            anomaly_vars: vec![],
            anom_clim_splits: vec![],
            normalisation_splits: vec![],
            strategy: NormaliseStrategy::MinMax,
            lag_time: 1,
            lead_time: 3,
            linear_trends: vec![],
            trend: TrendConfig::default(),
            no_normalise: vec![],
            parallel_opens: false,
            reference_dir: None,
            store: Arc::new(JsonCubeStore),
            transform: Arc::new(IdentityTransform),
        }
    }
}

impl ChannelProcessorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(mut self, dataset: Arc<dyn DatasetConfig>) -> Self {
        self.dataset = Some(dataset);
        self
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(output_dir.into());
        self
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_split(mut self, name: impl Into<String>, dates: Vec<TimeStamp>) -> Self {
        self.splits.insert(name.into(), dates);
        self
    }

    pub fn with_absolute_vars(mut self, vars: &[&str]) -> Self {
        self.absolute_vars = vars.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn with_anomaly_vars(mut self, vars: &[&str]) -> Self {
        self.anomaly_vars = vars.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn with_anom_clim_splits(mut self, splits: &[&str]) -> Self {
        self.anom_clim_splits = splits.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_normalisation_splits(mut self, splits: &[&str]) -> Self {
        self.normalisation_splits = splits.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_strategy(mut self, strategy: NormaliseStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_lag(mut self, lag_time: u32) -> Self {
        self.lag_time = lag_time;
        self
    }

    pub fn with_lead(mut self, lead_time: u32) -> Self {
        self.lead_time = lead_time;
        self
    }

    pub fn with_linear_trends(mut self, vars: &[&str], trend: TrendConfig) -> Self {
        self.linear_trends = vars.iter().map(|v| v.to_string()).collect();
        self.trend = trend;
        self
    }

    pub fn with_no_normalise(mut self, vars: &[&str]) -> Self {
        self.no_normalise = vars.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn with_parallel_opens(mut self, parallel_opens: bool) -> Self {
        self.parallel_opens = parallel_opens;
        self
    }

    pub fn with_reference_dir(mut self, reference_dir: Option<PathBuf>) -> Self {
        self.reference_dir = reference_dir;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn CubeStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_transform(mut self, transform: Arc<dyn ChannelTransform>) -> Self {
        self.transform = transform;
        self
    }

    /// Build the processor, running split extension and resolving the source
    /// index against the dataset.
    pub fn build(self) -> ProcResult<ChannelProcessor> {
        let dataset = self.dataset.ok_or_else(|| {
            ProcessingError::Configuration("a dataset configuration is required".to_string())
        })?;
        let output_dir = self.output_dir.ok_or_else(|| {
            ProcessingError::Configuration("an output directory is required".to_string())
        })?;
        let identifier = self
            .identifier
            .unwrap_or_else(|| dataset.identifier().to_string());

        let frequency = dataset.frequency();
        let file_exists = |t: TimeStamp| {
            dataset
                .variables()
                .iter()
                .all(|var| dataset.var_filepath(var, t).exists())
        };

        let mut splits = Splits::new();
        for (name, dates) in &self.splits {
            if dates.is_empty() {
                info!("No {} dates for this processor", name);
                splits.insert(name.clone(), vec![]);
                continue;
            }
            info!("Processing {} dates for {} category", dates.len(), name);
            if self.lag_time > 0 {
                info!("Including lag of {} {}s", self.lag_time, frequency);
            }
            if self.lead_time > 0 {
                info!("Including lead of {} {}s", self.lead_time, frequency);
            }
            let date_set: BTreeSet<TimeStamp> = dates.iter().copied().collect();
            let working =
                extend_split(&date_set, self.lag_time, self.lead_time, frequency, &file_exists);
            splits.insert(name.clone(), working.into_iter().collect());
        }

        let mut source_index = SourceIndex::new();
        for (name, dates) in &splits {
            let mut per_var = BTreeMap::new();
            for var in dataset.variables() {
                let files = dataset.var_filepaths(var, dates);
                info!("Got {} files for {}:{}", files.len(), name, var.name);
                per_var.insert(var.name.clone(), files);
            }
            source_index.insert(name.clone(), per_var);
        }

        let normaliser = Normaliser::new(self.strategy, &output_dir, self.reference_dir.clone());
        let climatologies = ClimatologyStore::new(&output_dir, self.reference_dir.clone());

        Ok(ChannelProcessor {
            dataset,
            output_dir,
            identifier,
            splits,
            source_index,
            absolute_vars: self.absolute_vars,
            anomaly_vars: self.anomaly_vars,
            anom_clim_splits: self.anom_clim_splits,
            normalisation_splits: self.normalisation_splits,
            normaliser,
            climatologies,
            lag_time: self.lag_time,
            lead_time: self.lead_time,
            linear_trends: self.linear_trends,
            trend: self.trend,
            no_normalise: self.no_normalise,
            parallel_opens: self.parallel_opens,
            reference_dir: self.reference_dir,
            store: self.store,
            transform: self.transform,
            missing_dates: vec![],
            processed: ProcessedFiles::new(),
        })
    }
}

/// Orchestrates normalisation and trend extrapolation for every configured
/// channel, then exports the manifest.
pub struct ChannelProcessor {
    dataset: Arc<dyn DatasetConfig>,
    output_dir: PathBuf,
    identifier: String,
    splits: Splits,
    source_index: SourceIndex,
    absolute_vars: Vec<String>,
    anomaly_vars: Vec<String>,
    anom_clim_splits: Vec<String>,
    normalisation_splits: Vec<String>,
    normaliser: Normaliser,
    climatologies: ClimatologyStore,
    lag_time: u32,
    lead_time: u32,
    linear_trends: Vec<String>,
    trend: TrendConfig,
    no_normalise: Vec<String>,
    parallel_opens: bool,
    reference_dir: Option<PathBuf>,
    store: Arc<dyn CubeStore>,
    transform: Arc<dyn ChannelTransform>,
    missing_dates: Vec<TimeStamp>,
    processed: ProcessedFiles,
}

impl ChannelProcessor {
    pub fn builder() -> ChannelProcessorBuilder {
        ChannelProcessorBuilder::new()
    }

    pub fn splits(&self) -> &Splits {
        &self.splits
    }

    pub fn source_index(&self) -> &SourceIndex {
        &self.source_index
    }

    pub fn processed_files(&self) -> &ProcessedFiles {
        &self.processed
    }

    /// Dates known to be globally absent, excluded from trend fitting.
    pub fn set_missing_dates(&mut self, missing_dates: Vec<TimeStamp>) {
        self.missing_dates = missing_dates;
    }

    fn split_dates(&self, names: &[String]) -> ProcResult<Vec<TimeStamp>> {
        let mut dates = vec![];
        for name in names {
            let split = self.splits.get(name).ok_or_else(|| {
                ProcessingError::Configuration(format!("unknown split: {}", name))
            })?;
            dates.extend(split.iter().copied());
        }
        Ok(dates)
    }

    fn norm_split_dates(&self) -> ProcResult<Vec<TimeStamp>> {
        self.split_dates(&self.normalisation_splits)
    }

    fn anom_split_dates(&self) -> ProcResult<Vec<TimeStamp>> {
        self.split_dates(&self.anom_clim_splits)
    }

    /// Output folder for one variable, created on first use.
    fn data_var_folder(&self, var_name: &str) -> ProcResult<PathBuf> {
        let folder = self.output_dir.join(var_name);
        fs::create_dir_all(&folder)?;
        Ok(folder)
    }

    fn source_variable_names(&self) -> BTreeSet<String> {
        self.source_index
            .values()
            .flat_map(|per_var| per_var.keys().cloned())
            .collect()
    }

    fn register(&mut self, name: &str, path: PathBuf) {
        let entry = self.processed.entry(name.to_string()).or_default();
        if entry.contains(&path) {
            warn!("{} already registered for {}", path.display(), name);
            return;
        }
        entry.push(path);
    }

    /// Fail-fast configuration validation, run before any file is opened.
    fn check_configuration(&self) -> ProcResult<()> {
        if !self.anomaly_vars.is_empty() && self.anom_clim_splits.is_empty() {
            return Err(ProcessingError::Configuration(
                "a list of climatology splits must be provided when anomaly channels are configured"
                    .to_string(),
            ));
        }
        self.anom_split_dates()?;
        self.norm_split_dates()?;
        for var_name in &self.linear_trends {
            if !self.absolute_vars.contains(var_name) {
                return Err(ProcessingError::Configuration(format!(
                    "linear trend requested without an absolute variable: {}",
                    var_name
                )));
            }
        }
        Ok(())
    }

    /// Process every configured variable × representation pair and write the
    /// manifest. Returns the manifest path.
    pub fn process(&mut self) -> ProcResult<PathBuf> {
        self.check_configuration()?;

        let available = self.source_variable_names();
        let channels: Vec<(String, &'static str)> = self
            .absolute_vars
            .iter()
            .map(|v| (v.clone(), "abs"))
            .chain(self.anomaly_vars.iter().map(|v| (v.clone(), "anom")))
            .collect();

        for (var_name, suffix) in channels {
            if !available.contains(&var_name) {
                warn!(
                    "{} does not exist in data, you can't use it as a variable",
                    var_name
                );
                continue;
            }
            self.process_channel(&var_name, suffix)?;
        }

        let manifest = self.manifest();
        let path = self
            .output_dir
            .join(format!("processed.{}.json", self.identifier));
        manifest.save(&path)?;
        Ok(path)
    }

    fn process_channel(&mut self, var_name: &str, suffix: &str) -> ProcResult<()> {
        let source_files: Vec<PathBuf> = self
            .source_index
            .values()
            .flat_map(|per_var| per_var.get(var_name).into_iter().flatten().cloned())
            .collect::<BTreeSet<PathBuf>>()
            .into_iter()
            .collect();

        if source_files.is_empty() {
            warn!("No source files resolved for {}", var_name);
            return Ok(());
        }

        info!("Opening {} files for {}", source_files.len(), var_name);
        let mut cube = self.store.read_many(&source_files, self.parallel_opens)?;

        if suffix == "anom" {
            let clim_dates = self.anom_split_dates()?;
            let climatology = self
                .climatologies
                .get_or_build(var_name, &cube, &clim_dates)?;
            climatology.apply_anomaly(&mut cube);
        }

        self.transform.pre_normalisation(var_name, &mut cube)?;

        if suffix == "abs" && self.linear_trends.contains(&var_name.to_string()) {
            self.build_trend(var_name, &cube)?;
        }

        if self.no_normalise.contains(&var_name.to_string()) {
            info!("No normalisation for {}", var_name);
        } else {
            info!("Normalising {}", var_name);
            let norm_dates = self.norm_split_dates()?;
            self.normaliser.normalise(var_name, &mut cube, &norm_dates)?;
        }

        self.transform.post_normalisation(var_name, &mut cube)?;

        let output_path = self.data_var_folder(var_name)?.join(format!(
            "{}_{}.{}",
            var_name,
            suffix,
            self.store.extension()
        ));
        self.store.write(&output_path, &cube)?;
        self.register(&format!("{}_{}", var_name, suffix), output_path);
        Ok(())
    }

    fn build_trend(&mut self, var_name: &str, cube: &DataCube) -> ProcResult<()> {
        let cache_path = self.data_var_folder(var_name)?.join(format!(
            "{}_linear_trend.{}",
            var_name,
            self.store.extension()
        ));

        // With a reference directory the trend fit runs against the reference
        // run's absolute channel rather than the local data.
        let reference = match &self.reference_dir {
            Some(refdir) => {
                info!(
                    "Loading reference absolute channel for linear trend of {} from {}",
                    var_name,
                    refdir.display()
                );
                let path = refdir
                    .join(var_name)
                    .join(format!("{}_abs.{}", var_name, self.store.extension()));
                Some(self.store.read(&path)?)
            }
            None => None,
        };

        build_linear_trend(
            cube,
            reference.as_ref().unwrap_or(cube),
            var_name,
            &self.trend,
            self.dataset.frequency(),
            &self.missing_dates,
            self.store.as_ref(),
            &cache_path,
        )?;
        self.register(&format!("{}_linear_trend", var_name), cache_path);
        Ok(())
    }

    /// The manifest describing this run's configuration and outputs.
    pub fn manifest(&self) -> Manifest {
        Manifest {
            implementation: IMPLEMENTATION.to_string(),
            absolute_vars: self.absolute_vars.clone(),
            anomaly_vars: self.anomaly_vars.clone(),
            dataset_config: self.dataset.config_ref(),
            lag_time: self.lag_time,
            lead_time: self.lead_time,
            linear_trends: self.linear_trends.clone(),
            linear_trend_steps: self.trend.steps.resolve(),
            path: self.output_dir.clone(),
            processed_files: self.processed.clone(),
            source_files: self.source_index.clone(),
            splits: self.splits.clone(),
        }
    }
}
