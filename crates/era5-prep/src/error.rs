//! Error types for the preparation pipeline.
//!
//! Only [`PrepError::Enumeration`] and [`PrepError::Config`] abort a run.
//! Every other variant is confined to the observation whose task raised it.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while preparing reanalysis artifacts.
#[derive(Error, Debug)]
pub enum PrepError {
    #[error("Failed to enumerate observations at {path}: {message}")]
    Enumeration { path: PathBuf, message: String },

    #[error("Failed to decode observation {path}: {message}")]
    Decode { path: PathBuf, message: String },

    #[error("Retrieval failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Interpolation failed: {0}")]
    Interpolation(#[from] InterpolationError),

    #[error("Artifact I/O failed for {path}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl PrepError {
    pub fn enumeration(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Enumeration {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn decode(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Decode {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn artifact(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Artifact {
            path: path.into(),
            source,
        }
    }

    /// Short machine-friendly label, used for metrics and the outcome ledger.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Enumeration { .. } => "enumeration",
            Self::Decode { .. } => "decode",
            Self::Fetch(_) => "fetch",
            Self::Interpolation(_) => "interpolation",
            Self::Artifact { .. } => "artifact",
            Self::Config(_) => "config",
        }
    }
}

/// Failures of the remote retrieval service.
///
/// The pipeline does not distinguish retryable from permanent failures; any
/// of these fails the artifact and with it the observation's task.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("No retrieval service credentials configured")]
    MissingCredentials,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Request rejected by service: {0}")]
    Rejected(String),

    #[error("Unexpected service response: {0}")]
    Protocol(String),

    #[error("Timed out after {0:?} waiting for the service")]
    Timeout(std::time::Duration),

    #[error("Failed to write retrieved data: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the external interpolation step.
#[derive(Error, Debug)]
pub enum InterpolationError {
    #[error("Interpolation command is empty")]
    EmptyCommand,

    #[error("Failed to start interpolation command '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Interpolation command exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },

    #[error("Interpolation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Interpolation reported success but produced no output at {0}")]
    MissingOutput(PathBuf),

    #[error("Interpolation input missing: {0}")]
    MissingInput(PathBuf),
}

/// Result type for preparation operations.
pub type Result<T> = std::result::Result<T, PrepError>;
