//! Common test doubles for era5-prep integration tests
//!
//! Provides:
//! - A recording remote client with injectable failures, latency and a
//!   concurrency high-water mark
//! - A recording interpolator that can be told to fail
//! - Pipeline builders over a `TestDirs` scratch area

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use era5_prep::{
    ArtifactKind, ArtifactNamer, CancellationToken, FetchError, FilenameDecoder, InstrumentKind,
    InterpolationError, Interpolator, ObservationDecoder, ObservationFile, Pipeline,
    PipelineConfig, ProductSpec, RemoteDataClient, TimeframePolicy,
};
use test_utils::TestDirs;

/// One recorded retrieval.
#[derive(Debug, Clone)]
pub struct Call {
    pub kind: ArtifactKind,
    pub date: String,
    pub destination: PathBuf,
}

impl Call {
    /// Observation id encoded in the destination file name.
    pub fn observation(&self) -> String {
        let name = self
            .destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let marker = format!("{}.", self.kind.suffix());
        name.split(marker.as_str())
            .next()
            .unwrap_or_default()
            .to_string()
    }
}

/// Remote client that writes a small file for each request.
#[derive(Default)]
pub struct RecordingClient {
    calls: Mutex<Vec<Call>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Option<Duration>,
    failures: HashSet<(String, ArtifactKind)>,
    panics: HashSet<(String, ArtifactKind)>,
    cancel_on_first_call: Option<CancellationToken>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the retrieval of `kind` for observation `id`.
    pub fn failing_on(mut self, id: &str, kind: ArtifactKind) -> Self {
        self.failures.insert((id.to_string(), kind));
        self
    }

    /// Panic inside the retrieval of `kind` for observation `id`.
    pub fn panicking_on(mut self, id: &str, kind: ArtifactKind) -> Self {
        self.panics.insert((id.to_string(), kind));
        self
    }

    /// Cancel `token` as soon as the first retrieval starts.
    pub fn cancelling(mut self, token: CancellationToken) -> Self {
        self.cancel_on_first_call = Some(token);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, id: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.observation() == id)
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteDataClient for RecordingClient {
    async fn retrieve(&self, spec: &ProductSpec, destination: &Path) -> Result<(), FetchError> {
        let call = Call {
            kind: spec.kind,
            date: spec.window.to_request_string(),
            destination: destination.to_path_buf(),
        };
        let id = call.observation();
        self.calls.lock().unwrap().push(call);

        if self.panics.contains(&(id.clone(), spec.kind)) {
            panic!("unexpected GRIB edition in {} response", spec.kind);
        }

        if let Some(token) = &self.cancel_on_first_call {
            token.cancel();
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let result = if self.failures.contains(&(id.clone(), spec.kind)) {
            // Leave a torn file behind the way an interrupted download would
            tokio::fs::write(destination, b"torn").await?;
            Err(FetchError::Status {
                status: 503,
                body: format!("service unavailable for {}", id),
            })
        } else {
            tokio::fs::write(destination, format!("{} {}", spec.kind, id)).await?;
            Ok(())
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Interpolator that concatenates its inputs, or fails on demand.
#[derive(Default)]
pub struct RecordingInterpolator {
    calls: AtomicUsize,
    fail: bool,
}

impl RecordingInterpolator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Interpolator for RecordingInterpolator {
    async fn interpolate(
        &self,
        low_res: &Path,
        high_res: &Path,
        output: &Path,
    ) -> Result<(), InterpolationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let low = tokio::fs::read(low_res)
            .await
            .map_err(|_| InterpolationError::MissingInput(low_res.to_path_buf()))?;
        let high = tokio::fs::read(high_res)
            .await
            .map_err(|_| InterpolationError::MissingInput(high_res.to_path_buf()))?;

        if self.fail {
            let _ = tokio::fs::write(output, b"half-written").await;
            return Err(InterpolationError::Exit {
                status: "exit status: 1".to_string(),
                stderr: "spectral transform diverged".to_string(),
            });
        }

        tokio::fs::write(output, [high, low].concat())
            .await
            .map_err(|source| InterpolationError::Spawn {
                program: "test".to_string(),
                source,
            })
    }
}

/// Decoder that panics for one file name and defers to the filename decoder otherwise.
pub struct PanickingDecoder {
    inner: FilenameDecoder,
    panic_on: String,
}

impl PanickingDecoder {
    pub fn new(panic_on: &str) -> Self {
        Self {
            inner: FilenameDecoder::new(InstrumentKind::new("CORAL")),
            panic_on: panic_on.to_string(),
        }
    }
}

impl ObservationDecoder for PanickingDecoder {
    fn decode(&self, file: &ObservationFile) -> era5_prep::Result<era5_prep::Observation> {
        if file.id.as_str() == self.panic_on {
            panic!("corrupt time axis in {}", file.file_name());
        }
        self.inner.decode(file)
    }
}

/// Night policy on, reference hour 15, threshold 6 h, default 2-day span.
pub fn night_config(max_concurrent: usize) -> PipelineConfig {
    PipelineConfig {
        max_concurrent,
        duration_threshold: chrono::Duration::hours(6),
        timeframe: TimeframePolicy {
            night_policy: true,
            reference_hour: 15,
            ..TimeframePolicy::default()
        },
        ..PipelineConfig::default()
    }
}

pub fn namer(dirs: &TestDirs) -> ArtifactNamer {
    ArtifactNamer::new(dirs.cache(), "nc")
}

pub fn build_pipeline(
    dirs: &TestDirs,
    config: PipelineConfig,
    client: Arc<RecordingClient>,
    interpolator: Arc<RecordingInterpolator>,
) -> Pipeline {
    build_pipeline_with_decoder(
        dirs,
        config,
        client,
        interpolator,
        Arc::new(FilenameDecoder::new(InstrumentKind::new("CORAL"))),
    )
}

pub fn build_pipeline_with_decoder(
    dirs: &TestDirs,
    config: PipelineConfig,
    client: Arc<RecordingClient>,
    interpolator: Arc<RecordingInterpolator>,
    decoder: Arc<dyn ObservationDecoder>,
) -> Pipeline {
    Pipeline::new(config, client, interpolator, decoder, namer(dirs))
        .expect("valid pipeline config")
}
