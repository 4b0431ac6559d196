//! ERA5 background preparation library.
//!
//! Prepares reanalysis data time-aligned to a catalog of instrument
//! observations: model levels at full and T21 resolution (merged into one
//! interpolated file), pressure levels and the 2 PVU surface.
//!
//! # Architecture
//!
//! - Observation catalog and decoders
//! - Timeframe selection with the day/night anchoring policy
//! - Artifact naming, cache lookup and atomic commit
//! - Remote data client (Climate Data Store adapter)
//! - Interpolation via an external command
//! - Bounded pipeline driver with per-observation failure isolation
//!
//! The filesystem cache is the only state; runs are resumable and a second
//! run over the same catalog issues no retrievals.

pub mod artifacts;
pub mod catalog;
pub mod error;
pub mod interpolate;
pub mod observation;
pub mod pipeline;
pub mod product;
pub mod report;
pub mod retrieve;
pub mod timeframe;

// Re-exports
pub use artifacts::{ArtifactKind, ArtifactNamer, ArtifactPaths};
pub use catalog::Catalog;
pub use error::{FetchError, InterpolationError, PrepError, Result};
pub use interpolate::{CommandInterpolator, Interpolator};
pub use observation::{
    FilenameDecoder, InstrumentKind, ManifestDecoder, ManifestEntry, Observation,
    ObservationDecoder, ObservationFile, ObservationId, DEFAULT_ID_PREFIX_LEN,
};
pub use pipeline::{FetchTask, Pipeline, PipelineConfig};
pub use product::{LevelType, ProductSpec, RetrievalSettings};
pub use report::{BatchReport, Progress, ProgressSnapshot, Tally, TaskOutcome, TaskReport, TaskState};
pub use retrieve::{CdsClient, CdsConfig, RemoteDataClient};
pub use timeframe::{select_window, TargetWindow, TimeframePolicy};

// Callers pass a token to `Pipeline::run`
pub use tokio_util::sync::CancellationToken;
