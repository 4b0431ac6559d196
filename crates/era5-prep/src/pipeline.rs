//! Bounded pipeline driver.
//!
//! Observations are admitted in catalog order into a pool of `N` slots. An
//! admitted task travels through a fixed-capacity queue to one of `N`
//! long-lived workers, carrying its slot with it; the slot is released when
//! the task value is dropped, on every exit path including panics.
//!
//! Per task:
//! 1. Decode the observation; at or below the duration threshold it is
//!    skipped without any I/O.
//! 2. Select the target window.
//! 3. Unless the interpolated artifact is cached, fetch the missing raw
//!    model-level inputs, interpolate, commit, then delete both raws.
//! 4. Fetch the pressure-level and PV artifacts if missing.
//!
//! Failures stay inside their task and are recorded in the [`BatchReport`].

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use metrics::{counter, histogram};
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::artifacts::{self, ArtifactKind, ArtifactNamer, ArtifactPaths};
use crate::error::{PrepError, Result};
use crate::interpolate::Interpolator;
use crate::observation::{Observation, ObservationDecoder, ObservationFile, ObservationId};
use crate::product::{ProductSpec, RetrievalSettings};
use crate::report::{BatchReport, Progress, TaskOutcome, TaskReport, TaskState};
use crate::retrieve::RemoteDataClient;
use crate::timeframe::{TargetWindow, TimeframePolicy};

/// Immutable parameters of a run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Concurrency ceiling N
    pub max_concurrent: usize,
    /// Observations this short or shorter are skipped
    pub duration_threshold: chrono::Duration,
    pub timeframe: TimeframePolicy,
    pub retrieval: RetrievalSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            duration_threshold: chrono::Duration::hours(6),
            timeframe: TimeframePolicy::default(),
            retrieval: RetrievalSettings::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(PrepError::Config(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.duration_threshold < chrono::Duration::zero() {
            return Err(PrepError::Config(
                "duration threshold must not be negative".to_string(),
            ));
        }
        if self.timeframe.reference_hour > 24 {
            return Err(PrepError::Config(format!(
                "reference hour {} is outside 0..=24",
                self.timeframe.reference_hour
            )));
        }
        Ok(())
    }
}

/// One observation's unit of work, owned by a single worker.
#[derive(Debug, Clone)]
pub struct FetchTask {
    pub observation: Observation,
    pub window: TargetWindow,
    pub paths: ArtifactPaths,
    pub retrieval: RetrievalSettings,
}

impl FetchTask {
    pub fn new(
        observation: Observation,
        window: TargetWindow,
        namer: &ArtifactNamer,
        retrieval: RetrievalSettings,
    ) -> Self {
        let paths = namer.paths_for(&observation.id);
        Self {
            observation,
            window,
            paths,
            retrieval,
        }
    }

    /// Retrieval request for `kind`; `None` for the derived kind.
    pub fn spec(&self, kind: ArtifactKind) -> Option<ProductSpec> {
        ProductSpec::for_artifact(kind, self.window, &self.retrieval)
    }
}

/// A pool slot. Releasing it is tied to drop.
struct SlotGuard {
    _permit: OwnedSemaphorePermit,
    progress: Arc<Progress>,
}

impl SlotGuard {
    fn new(permit: OwnedSemaphorePermit, progress: Arc<Progress>) -> Self {
        progress.slot_acquired();
        Self {
            _permit: permit,
            progress,
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        // Runs before the permit field is dropped
        self.progress.slot_released();
    }
}

/// A queued task holding its slot.
struct Admitted {
    index: usize,
    file: ObservationFile,
    slot: SlotGuard,
}

struct Shared {
    config: PipelineConfig,
    client: Arc<dyn RemoteDataClient>,
    interpolator: Arc<dyn Interpolator>,
    decoder: Arc<dyn ObservationDecoder>,
    namer: ArtifactNamer,
    progress: Arc<Progress>,
}

/// The bounded download/cache/interpolation driver.
pub struct Pipeline {
    shared: Arc<Shared>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        client: Arc<dyn RemoteDataClient>,
        interpolator: Arc<dyn Interpolator>,
        decoder: Arc<dyn ObservationDecoder>,
        namer: ArtifactNamer,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                client,
                interpolator,
                decoder,
                namer,
                progress: Arc::new(Progress::new()),
            }),
        })
    }

    /// Live counters of the current (or last) run.
    pub fn progress(&self) -> Arc<Progress> {
        self.shared.progress.clone()
    }

    pub fn namer(&self) -> &ArtifactNamer {
        &self.shared.namer
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    /// Process every observation and return their outcomes.
    ///
    /// Cancelling `shutdown` stops admission; admitted tasks run to the end
    /// and the rest are reported as cancelled.
    pub async fn run(
        &self,
        observations: Vec<ObservationFile>,
        shutdown: CancellationToken,
    ) -> BatchReport {
        let started = Instant::now();
        let total = observations.len();
        let (unique, duplicates) = split_duplicates(observations);
        let capacity = self.shared.config.max_concurrent;
        let progress = self.shared.progress.clone();
        progress.begin(total as u64);

        info!(
            observations = total,
            max_concurrent = capacity,
            cache = %self.shared.namer.root().display(),
            "Starting preparation run"
        );

        let slots = Arc::new(Semaphore::new(capacity));
        let (queue_tx, queue_rx) = mpsc::channel::<Admitted>(capacity);
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<TaskReport>();

        let mut workers = JoinSet::new();
        for worker_id in 0..capacity.min(unique.len()) {
            let shared = self.shared.clone();
            let queue_rx = queue_rx.clone();
            let report_tx = report_tx.clone();
            workers.spawn(async move {
                loop {
                    let next = queue_rx.lock().await.recv().await;
                    let Some(job) = next else { break };
                    let report = execute(&shared, job).await;
                    if report_tx.send(report).is_err() {
                        break;
                    }
                }
                debug!(worker = worker_id, "Worker finished");
            });
        }
        drop(report_tx);

        let mut cancelled = Vec::new();
        let mut pending = unique.into_iter();

        while let Some((index, file)) = pending.next() {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                permit = slots.clone().acquire_owned() => permit.ok(),
            };

            let Some(permit) = permit else {
                cancelled.push((index, file));
                break;
            };

            let job = Admitted {
                index,
                file,
                slot: SlotGuard::new(permit, progress.clone()),
            };
            if let Err(mpsc::error::SendError(job)) = queue_tx.send(job).await {
                error!("Worker pool stopped accepting tasks");
                cancelled.push((job.index, job.file));
                break;
            }
        }
        cancelled.extend(pending);
        drop(queue_tx);

        if !cancelled.is_empty() {
            warn!(
                cancelled = cancelled.len(),
                "Shutdown requested, draining admitted tasks"
            );
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task aborted");
            }
        }

        let mut reports = Vec::with_capacity(total);
        while let Some(report) = report_rx.recv().await {
            reports.push(report);
        }
        for (index, file) in cancelled {
            let outcome = TaskOutcome::Cancelled;
            progress.record(&outcome);
            reports.push(TaskReport {
                index,
                observation: file.id,
                path: file.path,
                outcome,
                elapsed: std::time::Duration::ZERO,
            });
        }
        for (index, file, first) in duplicates {
            let error = PrepError::decode(
                &file.path,
                format!(
                    "observation id {} already used by {}",
                    file.id,
                    first.display()
                ),
            );
            warn!(observation = %file.id, path = %file.path.display(), "Duplicate observation id");
            let outcome = TaskOutcome::Failed {
                stage: TaskState::Pending,
                error_kind: error.kind().to_string(),
                message: error.to_string(),
            };
            progress.record(&outcome);
            reports.push(TaskReport {
                index,
                observation: file.id,
                path: file.path,
                outcome,
                elapsed: std::time::Duration::ZERO,
            });
        }

        let batch = BatchReport::new(reports, started.elapsed());
        info!(
            done = batch.tally.done,
            skipped = batch.tally.skipped,
            failed = batch.tally.failed,
            cancelled = batch.tally.cancelled,
            elapsed_secs = batch.elapsed.as_secs(),
            "Preparation run complete"
        );
        batch
    }
}

/// Keep the first file for each observation id, in catalog order.
///
/// Later files with the same id would share artifact paths, so they are
/// returned separately with the path of the file that claimed the id.
fn split_duplicates(
    observations: Vec<ObservationFile>,
) -> (
    Vec<(usize, ObservationFile)>,
    Vec<(usize, ObservationFile, PathBuf)>,
) {
    let mut claimed: HashMap<ObservationId, PathBuf> = HashMap::new();
    let mut unique = Vec::with_capacity(observations.len());
    let mut duplicates = Vec::new();

    for (index, file) in observations.into_iter().enumerate() {
        match claimed.get(&file.id) {
            Some(first) => {
                let first = first.clone();
                duplicates.push((index, file, first));
            }
            None => {
                claimed.insert(file.id.clone(), file.path.clone());
                unique.push((index, file));
            }
        }
    }

    (unique, duplicates)
}

/// Run one admitted task to a terminal outcome, then release its slot.
async fn execute(shared: &Shared, job: Admitted) -> TaskReport {
    let Admitted { index, file, slot } = job;
    let started = Instant::now();

    let mut stage = TaskState::Admitted;
    let caught = AssertUnwindSafe(run_task(shared, &file, &mut stage))
        .catch_unwind()
        .await;

    let outcome = match caught {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(
                observation = %file.id,
                stage = stage.as_str(),
                panic = %message,
                "Task panicked"
            );
            TaskOutcome::Failed {
                stage,
                error_kind: "panic".to_string(),
                message,
            }
        }
    };
    drop(slot);

    let elapsed = started.elapsed();
    histogram!("era5_task_duration_seconds", "outcome" => outcome.label())
        .record(elapsed.as_secs_f64());

    let progress = &shared.progress;
    progress.record(&outcome);
    let snap = progress.snapshot();
    info!(
        progress = format!("{}/{}", progress.completed(), snap.total),
        done = snap.done,
        skipped = snap.skipped,
        failed = snap.failed,
        "Pipeline progress"
    );

    TaskReport {
        index,
        observation: file.id,
        path: file.path,
        outcome,
        elapsed,
    }
}

#[instrument(skip(shared, file, state), fields(observation = %file.id))]
async fn run_task(shared: &Shared, file: &ObservationFile, state: &mut TaskState) -> TaskOutcome {
    match prepare(shared, file, state).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(
                path = %file.path.display(),
                stage = state.as_str(),
                error = %e,
                "Observation failed"
            );
            TaskOutcome::Failed {
                stage: *state,
                error_kind: e.kind().to_string(),
                message: e.to_string(),
            }
        }
    }
}

/// The per-task sequence. `state` names the step an error came from.
async fn prepare(
    shared: &Shared,
    file: &ObservationFile,
    state: &mut TaskState,
) -> Result<TaskOutcome> {
    let observation = shared.decoder.decode(file)?;

    if observation.duration <= shared.config.duration_threshold {
        *state = TaskState::Skipped;
        let duration_hours = observation.duration.num_seconds() as f64 / 3600.0;
        info!(
            duration_hours,
            threshold_hours = shared.config.duration_threshold.num_seconds() as f64 / 3600.0,
            "Observation too short, skipping"
        );
        return Ok(TaskOutcome::Skipped { duration_hours });
    }

    let window = shared.config.timeframe.select(&observation);
    debug!(
        start = %observation.start,
        instrument = %observation.instrument,
        window = %window.to_request_string(),
        "Selected target window"
    );

    let task = FetchTask::new(
        observation,
        window,
        &shared.namer,
        shared.config.retrieval.clone(),
    );

    *state = TaskState::Fetching;
    let mut fetched = Vec::new();
    let mut interpolated = false;

    if artifacts::exists(&task.paths.model_level_interpolated).await? {
        debug!("Interpolated model levels cached");
        // Leftovers of a run interrupted between commit and cleanup
        remove_raw_inputs(&task.paths).await?;
    } else {
        for kind in [
            ArtifactKind::ModelLevelRaw,
            ArtifactKind::ModelLevelTruncatedRaw,
        ] {
            if fetch_if_absent(shared, &task, kind).await? {
                fetched.push(kind);
            }
        }

        *state = TaskState::Interpolating;
        interpolate(shared, &task).await?;
        interpolated = true;
        *state = TaskState::Fetching;
    }

    for kind in [
        ArtifactKind::PressureLevel,
        ArtifactKind::PotentialVorticityLevel,
    ] {
        if fetch_if_absent(shared, &task, kind).await? {
            fetched.push(kind);
        }
    }

    *state = TaskState::Done;
    info!(fetched = fetched.len(), interpolated, "Observation done");
    Ok(TaskOutcome::Done {
        fetched,
        interpolated,
    })
}

/// Check the cache and retrieve `kind` if it is absent. Returns true if fetched.
async fn fetch_if_absent(shared: &Shared, task: &FetchTask, kind: ArtifactKind) -> Result<bool> {
    let path = task.paths.get(kind);
    if artifacts::exists(path).await? {
        debug!(kind = %kind, path = %path.display(), "Artifact cached");
        counter!("era5_cache_hits_total", "kind" => kind.as_str()).increment(1);
        return Ok(false);
    }

    let spec = task.spec(kind).ok_or_else(|| {
        PrepError::Config(format!("artifact kind {} cannot be retrieved", kind))
    })?;

    if let Some(parent) = path.parent() {
        artifacts::ensure_dir(parent).await?;
    }
    let partial = artifacts::partial_path(path);

    info!(
        kind = %kind,
        date = %task.window.to_request_string(),
        path = %path.display(),
        "Retrieving artifact"
    );
    let started = Instant::now();

    if let Err(e) = shared.client.retrieve(&spec, &partial).await {
        artifacts::discard_partial(&partial).await;
        counter!("era5_retrievals_total", "kind" => kind.as_str(), "result" => "error")
            .increment(1);
        return Err(e.into());
    }
    artifacts::commit(&partial, path).await?;

    let elapsed = started.elapsed();
    counter!("era5_retrievals_total", "kind" => kind.as_str(), "result" => "ok").increment(1);
    histogram!("era5_retrieval_duration_seconds", "kind" => kind.as_str())
        .record(elapsed.as_secs_f64());
    info!(kind = %kind, elapsed_secs = elapsed.as_secs(), "Artifact retrieved");

    Ok(true)
}

/// Derive the interpolated artifact, then delete its raw inputs.
///
/// On failure the raw inputs stay so a later run only repeats this step.
async fn interpolate(shared: &Shared, task: &FetchTask) -> Result<()> {
    let paths = &task.paths;
    let target = &paths.model_level_interpolated;
    if let Some(parent) = target.parent() {
        artifacts::ensure_dir(parent).await?;
    }
    let partial = artifacts::partial_path(target);

    info!(output = %target.display(), "Interpolating model levels");
    let started = Instant::now();

    if let Err(e) = shared
        .interpolator
        .interpolate(&paths.model_level_t21, &paths.model_level, &partial)
        .await
    {
        artifacts::discard_partial(&partial).await;
        counter!("era5_interpolations_total", "result" => "error").increment(1);
        return Err(e.into());
    }
    artifacts::commit(&partial, target).await?;

    counter!("era5_interpolations_total", "result" => "ok").increment(1);
    info!(
        elapsed_secs = started.elapsed().as_secs(),
        "Interpolation complete"
    );

    remove_raw_inputs(paths).await
}

async fn remove_raw_inputs(paths: &ArtifactPaths) -> Result<()> {
    for kind in [
        ArtifactKind::ModelLevelRaw,
        ArtifactKind::ModelLevelTruncatedRaw,
    ] {
        let path = paths.get(kind);
        if artifacts::exists(path).await? {
            artifacts::remove(path).await?;
            debug!(kind = %kind, path = %path.display(), "Removed raw model-level input");
        }
    }
    Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}
