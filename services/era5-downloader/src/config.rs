//! Run configuration loading.
//!
//! One YAML file describes a run: where the observations are, where the
//! cache goes, the timeframe policy and the retrieval parameters.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::FixedOffset;
use era5_common::{Area, Grid};
use era5_prep::{
    CdsConfig, InstrumentKind, PipelineConfig, RetrievalSettings, TimeframePolicy,
    DEFAULT_ID_PREFIX_LEN,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Name of the cache folder below the output folder.
pub const CACHE_FOLDER: &str = "era5-region";

/// Invalid combinations that serde defaults cannot catch.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("input needs one of `folder`, `file` or `manifest`")]
    MissingInput,

    #[error("utc_offset_hours {0} is outside -24..24")]
    InvalidOffset(f64),

    #[error("duration_threshold_hours must be a non-negative number, got {0}")]
    InvalidThreshold(f64),

    #[error("interpolation.command is empty")]
    MissingInterpolationCommand,
}

/// Root configuration loaded from a run YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    pub input: InputConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub timeframe: TimeframeConfig,
    #[serde(default)]
    pub era5: Era5Config,
    #[serde(default)]
    pub cds: CdsSection,
    #[serde(default)]
    pub interpolation: InterpolationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Instrument label, e.g. "CORAL" or "TELMA"
    #[serde(default = "default_instrument")]
    pub instrument: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Observations this short or shorter are skipped
    #[serde(default = "default_duration_threshold")]
    pub duration_threshold_hours: f64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instrument: default_instrument(),
            max_concurrent: default_max_concurrent(),
            duration_threshold_hours: default_duration_threshold(),
        }
    }
}

fn default_instrument() -> String {
    "CORAL".to_string()
}

fn default_max_concurrent() -> usize {
    4
}

fn default_duration_threshold() -> f64 {
    6.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputConfig {
    /// Folder holding the observation files
    #[serde(default)]
    pub folder: Option<PathBuf>,
    /// Resolution-specific wildcard, e.g. "*T15Z900.nc"
    #[serde(default = "default_pattern")]
    pub pattern: String,
    /// Process only this file (relative to `folder` unless absolute)
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// YAML manifest with decoded start times and durations
    #[serde(default)]
    pub manifest: Option<PathBuf>,
    #[serde(default = "default_id_prefix_len")]
    pub id_prefix_len: usize,
}

fn default_pattern() -> String {
    "*.nc".to_string()
}

fn default_id_prefix_len() -> usize {
    DEFAULT_ID_PREFIX_LEN
}

/// Where the catalog comes from, resolved from [`InputConfig`].
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogSource {
    Manifest(PathBuf),
    File(PathBuf),
    Directory { folder: PathBuf, pattern: String },
}

impl InputConfig {
    /// A manifest wins over a single file, which wins over a folder listing.
    pub fn source(&self) -> Result<CatalogSource, ConfigError> {
        if let Some(manifest) = &self.manifest {
            return Ok(CatalogSource::Manifest(manifest.clone()));
        }
        if let Some(file) = &self.file {
            let path = match &self.folder {
                Some(folder) if file.is_relative() => folder.join(file),
                _ => file.clone(),
            };
            return Ok(CatalogSource::File(path));
        }
        match &self.folder {
            Some(folder) => Ok(CatalogSource::Directory {
                folder: folder.clone(),
                pattern: self.pattern.clone(),
            }),
            None => Err(ConfigError::MissingInput),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    pub folder: PathBuf,
}

impl OutputConfig {
    pub fn cache_root(&self) -> PathBuf {
        self.folder.join(CACHE_FOLDER)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeframeConfig {
    /// Attribute early-morning starts to the previous night
    #[serde(default)]
    pub night_policy: bool,
    #[serde(default = "default_reference_hour")]
    pub reference_hour: u32,
    /// Local time offset used for the reference hour
    #[serde(default)]
    pub utc_offset_hours: f64,
    #[serde(default = "default_span_days")]
    pub default_span_days: u32,
    #[serde(default = "default_instruments")]
    pub instruments: HashMap<String, InstrumentTimeframe>,
}

impl Default for TimeframeConfig {
    fn default() -> Self {
        Self {
            night_policy: false,
            reference_hour: default_reference_hour(),
            utc_offset_hours: 0.0,
            default_span_days: default_span_days(),
            instruments: default_instruments(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentTimeframe {
    pub span_days: u32,
}

fn default_reference_hour() -> u32 {
    15
}

fn default_span_days() -> u32 {
    2
}

fn default_instruments() -> HashMap<String, InstrumentTimeframe> {
    HashMap::from([("TELMA".to_string(), InstrumentTimeframe { span_days: 1 })])
}

impl TimeframeConfig {
    pub fn policy(&self) -> Result<TimeframePolicy, ConfigError> {
        let seconds = (self.utc_offset_hours * 3600.0).round();
        if !seconds.is_finite() || seconds.abs() >= 86_400.0 {
            return Err(ConfigError::InvalidOffset(self.utc_offset_hours));
        }
        let utc_offset = FixedOffset::east_opt(seconds as i32)
            .ok_or(ConfigError::InvalidOffset(self.utc_offset_hours))?;

        Ok(TimeframePolicy {
            night_policy: self.night_policy,
            reference_hour: self.reference_hour,
            utc_offset,
            default_span_days: self.default_span_days,
            instrument_spans: self
                .instruments
                .iter()
                .map(|(name, t)| (InstrumentKind::new(name), t.span_days))
                .collect(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Era5Config {
    #[serde(default = "default_dataset")]
    pub dataset: String,
    /// "N/W/S/E"
    #[serde(default = "Area::global")]
    pub area: Area,
    #[serde(default)]
    pub grid: Grid,
    #[serde(default = "default_format")]
    pub format: String,
}

impl Default for Era5Config {
    fn default() -> Self {
        Self {
            dataset: default_dataset(),
            area: Area::global(),
            grid: Grid::default(),
            format: default_format(),
        }
    }
}

fn default_dataset() -> String {
    era5_prep::product::DEFAULT_DATASET.to_string()
}

fn default_format() -> String {
    "netcdf".to_string()
}

impl Era5Config {
    pub fn retrieval(&self) -> RetrievalSettings {
        RetrievalSettings {
            dataset: self.dataset.clone(),
            area: self.area,
            grid: self.grid,
            format: self.format.clone(),
        }
    }
}

/// Retrieval service connection. Missing credentials fall back to the
/// `CDSAPI_URL`/`CDSAPI_KEY` environment and `~/.cdsapirc`.
#[derive(Debug, Clone, Deserialize)]
pub struct CdsSection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for CdsSection {
    fn default() -> Self {
        Self {
            url: None,
            key: None,
            poll_interval_secs: default_poll_interval(),
            max_wait_secs: default_max_wait(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_poll_interval() -> u64 {
    30
}

fn default_max_wait() -> u64 {
    24 * 3600
}

fn default_max_retries() -> u32 {
    5
}

impl CdsSection {
    /// Client settings with credentials resolved.
    pub fn client_config(&self) -> Result<CdsConfig> {
        CdsConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_wait: Duration::from_secs(self.max_wait_secs),
            max_retries: self.max_retries,
            ..CdsConfig::default()
        }
        .resolve_credentials(self.url.clone(), self.key.clone())
        .context("No CDS credentials in config, CDSAPI_URL/CDSAPI_KEY or ~/.cdsapirc")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InterpolationConfig {
    /// argv with `{lowres}`, `{highres}` and `{output}` placeholders
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl InterpolationConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl RunConfig {
    /// Load a run configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: RunConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        debug!(path = %path.display(), instrument = %config.general.instrument, "Loaded run config");
        Ok(config)
    }

    /// Check everything that can be checked before the run starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.input.source()?;
        self.timeframe.policy()?;
        if !self.general.duration_threshold_hours.is_finite()
            || self.general.duration_threshold_hours < 0.0
        {
            return Err(ConfigError::InvalidThreshold(
                self.general.duration_threshold_hours,
            ));
        }
        if self.interpolation.command.is_empty() {
            return Err(ConfigError::MissingInterpolationCommand);
        }
        Ok(())
    }

    pub fn instrument(&self) -> InstrumentKind {
        InstrumentKind::new(&self.general.instrument)
    }

    /// Immutable pipeline parameters; `max_concurrent` overrides the file.
    pub fn pipeline_config(&self, max_concurrent: Option<usize>) -> Result<PipelineConfig> {
        self.validate()?;
        let threshold_secs = (self.general.duration_threshold_hours * 3600.0).round() as i64;

        Ok(PipelineConfig {
            max_concurrent: max_concurrent.unwrap_or(self.general.max_concurrent),
            duration_threshold: chrono::Duration::seconds(threshold_secs),
            timeframe: self.timeframe.policy()?,
            retrieval: self.era5.retrieval(),
        })
    }
}
