//! Artifact naming and the on-disk cache lookup.
//!
//! The filesystem is the only record of what has been prepared. An artifact
//! is either absent or complete: writers produce `<name>.partial` next to the
//! final path and rename it into place, so an interrupted run never leaves a
//! file that looks finished.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::error::{PrepError, Result};
use crate::observation::ObservationId;

/// Suffix appended to in-flight artifact files.
pub const PARTIAL_SUFFIX: &str = "partial";

/// The five cached products prepared per observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Full-resolution model levels, input to interpolation
    ModelLevelRaw,
    /// T21-truncated model levels, input to interpolation
    ModelLevelTruncatedRaw,
    /// Merged model levels derived from the two raw inputs
    ModelLevelInterpolated,
    PressureLevel,
    PotentialVorticityLevel,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 5] = [
        ArtifactKind::ModelLevelRaw,
        ArtifactKind::ModelLevelTruncatedRaw,
        ArtifactKind::ModelLevelInterpolated,
        ArtifactKind::PressureLevel,
        ArtifactKind::PotentialVorticityLevel,
    ];

    /// File name suffix after the observation prefix.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::ModelLevelRaw => "-ml",
            Self::ModelLevelTruncatedRaw => "-ml-T21",
            Self::ModelLevelInterpolated => "-ml-int",
            Self::PressureLevel => "-pl",
            Self::PotentialVorticityLevel => "-pvu",
        }
    }

    /// Cache subdirectory holding this kind.
    pub fn category(&self) -> &'static str {
        match self {
            Self::ModelLevelRaw | Self::ModelLevelTruncatedRaw | Self::ModelLevelInterpolated => {
                "model-levels"
            }
            Self::PressureLevel => "pressure-levels",
            Self::PotentialVorticityLevel => "pv-levels",
        }
    }

    /// Short label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        &self.suffix()[1..]
    }

    /// True for the two inputs deleted after a successful interpolation.
    pub fn is_interpolation_input(&self) -> bool {
        matches!(self, Self::ModelLevelRaw | Self::ModelLevelTruncatedRaw)
    }

    /// True for kinds produced locally rather than retrieved.
    pub fn is_derived(&self) -> bool {
        matches!(self, Self::ModelLevelInterpolated)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All cache paths of one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub model_level: PathBuf,
    pub model_level_t21: PathBuf,
    pub model_level_interpolated: PathBuf,
    pub pressure_level: PathBuf,
    pub potential_vorticity: PathBuf,
}

impl ArtifactPaths {
    pub fn get(&self, kind: ArtifactKind) -> &Path {
        match kind {
            ArtifactKind::ModelLevelRaw => &self.model_level,
            ArtifactKind::ModelLevelTruncatedRaw => &self.model_level_t21,
            ArtifactKind::ModelLevelInterpolated => &self.model_level_interpolated,
            ArtifactKind::PressureLevel => &self.pressure_level,
            ArtifactKind::PotentialVorticityLevel => &self.potential_vorticity,
        }
    }
}

/// Deterministic mapping from (observation, kind) to a cache path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactNamer {
    root: PathBuf,
    extension: String,
}

impl ArtifactNamer {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<category>/<observation-id><suffix>.<ext>`
    pub fn path_for(&self, id: &ObservationId, kind: ArtifactKind) -> PathBuf {
        self.root.join(kind.category()).join(format!(
            "{}{}.{}",
            id.as_str(),
            kind.suffix(),
            self.extension
        ))
    }

    pub fn paths_for(&self, id: &ObservationId) -> ArtifactPaths {
        ArtifactPaths {
            model_level: self.path_for(id, ArtifactKind::ModelLevelRaw),
            model_level_t21: self.path_for(id, ArtifactKind::ModelLevelTruncatedRaw),
            model_level_interpolated: self.path_for(id, ArtifactKind::ModelLevelInterpolated),
            pressure_level: self.path_for(id, ArtifactKind::PressureLevel),
            potential_vorticity: self.path_for(id, ArtifactKind::PotentialVorticityLevel),
        }
    }

    /// Distinct category directories under the root.
    pub fn category_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = ArtifactKind::ALL
            .iter()
            .map(|k| self.root.join(k.category()))
            .collect();
        dirs.dedup();
        dirs
    }

    /// Create the root and every category directory.
    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in self.category_dirs() {
            ensure_dir(&dir).await?;
        }
        Ok(())
    }
}

/// Is the artifact present right now?
///
/// Always asks the filesystem; nothing is remembered between calls. An
/// unreadable location is an error, not a miss.
pub async fn exists(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| PrepError::artifact(path, e))
}

/// Temporary path an artifact is written to before it is committed.
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Atomically move a finished partial file to its final path.
pub async fn commit(partial: &Path, path: &Path) -> Result<()> {
    tokio::fs::rename(partial, path)
        .await
        .map_err(|e| PrepError::artifact(path, e))?;
    debug!(path = %path.display(), "Committed artifact");
    Ok(())
}

/// Delete an artifact. Deleting something already gone is not an error.
pub async fn remove(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PrepError::artifact(path, e)),
    }
}

/// Best-effort removal of a partial file left by a failed or interrupted write.
pub async fn discard_partial(partial: &Path) {
    if let Err(e) = remove(partial).await {
        debug!(path = %partial.display(), error = %e, "Could not discard partial artifact");
    }
}

/// Create a directory and its parents; concurrent creators are fine.
pub async fn ensure_dir(dir: &Path) -> Result<()> {
    match tokio::fs::create_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        Err(e) => Err(PrepError::artifact(dir, e)),
    }
}
