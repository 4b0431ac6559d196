//! Interpolation stage.
//!
//! Merges the full-resolution and T21-truncated model-level files into one
//! interpolated file. The numerics live in an external program; this module
//! runs it and checks the result.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::error::InterpolationError;

/// Placeholder for the full-resolution input path.
pub const HIGH_RES_PLACEHOLDER: &str = "{highres}";
/// Placeholder for the T21 input path.
pub const LOW_RES_PLACEHOLDER: &str = "{lowres}";
/// Placeholder for the output path.
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

const STDERR_TAIL_CHARS: usize = 2000;

/// Produces an interpolated file from the two raw model-level files.
#[async_trait]
pub trait Interpolator: Send + Sync {
    /// Write the interpolated result to `output`.
    ///
    /// The inputs are left untouched; deleting them is the caller's job.
    async fn interpolate(
        &self,
        low_res: &Path,
        high_res: &Path,
        output: &Path,
    ) -> Result<(), InterpolationError>;
}

/// Runs an external command, e.g. `["era5-interp", "{lowres}", "{highres}", "{output}"]`.
#[derive(Debug, Clone)]
pub struct CommandInterpolator {
    command: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandInterpolator {
    pub fn new(command: Vec<String>, timeout: Option<Duration>) -> Result<Self, InterpolationError> {
        if command.first().map_or(true, |p| p.trim().is_empty()) {
            return Err(InterpolationError::EmptyCommand);
        }
        Ok(Self { command, timeout })
    }

    fn arguments(&self, low_res: &Path, high_res: &Path, output: &Path) -> Vec<String> {
        let low = low_res.to_string_lossy();
        let high = high_res.to_string_lossy();
        let out = output.to_string_lossy();

        self.command[1..]
            .iter()
            .map(|arg| {
                arg.replace(LOW_RES_PLACEHOLDER, &low)
                    .replace(HIGH_RES_PLACEHOLDER, &high)
                    .replace(OUTPUT_PLACEHOLDER, &out)
            })
            .collect()
    }
}

#[async_trait]
impl Interpolator for CommandInterpolator {
    #[instrument(skip(self), fields(program = %self.command[0]))]
    async fn interpolate(
        &self,
        low_res: &Path,
        high_res: &Path,
        output: &Path,
    ) -> Result<(), InterpolationError> {
        for input in [low_res, high_res] {
            if !tokio::fs::try_exists(input).await.unwrap_or(false) {
                return Err(InterpolationError::MissingInput(input.to_path_buf()));
            }
        }

        let program = &self.command[0];
        let args = self.arguments(low_res, high_res, output);
        debug!(args = ?args, "Running interpolation command");

        let child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| InterpolationError::Spawn {
                program: program.clone(),
                source,
            })?;

        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| InterpolationError::Timeout(limit))?,
            None => child.wait_with_output().await,
        };

        let output_status = result.map_err(|source| InterpolationError::Spawn {
            program: program.clone(),
            source,
        })?;

        if !output_status.status.success() {
            let stderr = String::from_utf8_lossy(&output_status.stderr);
            return Err(InterpolationError::Exit {
                status: output_status.status.to_string(),
                stderr: tail(stderr.trim(), STDERR_TAIL_CHARS),
            });
        }

        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            return Err(InterpolationError::MissingOutput(output.to_path_buf()));
        }

        Ok(())
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max_chars)).collect()
}
