//! Progress counters and per-run outcome reporting.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::{counter, gauge};
use serde::Serialize;

use crate::artifacts::ArtifactKind;
use crate::observation::ObservationId;

/// Lifecycle of one observation's task.
///
/// `Pending -> Admitted -> {Skipped | Fetching -> Interpolating -> Done} | Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Admitted,
    Skipped,
    Fetching,
    Interpolating,
    Done,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Admitted => "admitted",
            Self::Skipped => "skipped",
            Self::Fetching => "fetching",
            Self::Interpolating => "interpolating",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// Terminal result of one observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Every artifact is present.
    Done {
        /// Kinds retrieved during this run (cache hits excluded)
        fetched: Vec<ArtifactKind>,
        /// Whether the interpolated artifact was derived during this run
        interpolated: bool,
    },
    /// Duration at or below the threshold; nothing was touched.
    Skipped { duration_hours: f64 },
    /// The task stopped at `stage`.
    Failed {
        stage: TaskState,
        error_kind: String,
        message: String,
    },
    /// Never admitted because the run was shut down.
    Cancelled,
}

impl TaskOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Done { .. } => "done",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Outcome of one observation within a run.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    /// Position in catalog order
    pub index: usize,
    pub observation: ObservationId,
    pub path: PathBuf,
    pub outcome: TaskOutcome,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
}

/// Outcome counts of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub done: u64,
    pub skipped: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl Tally {
    pub fn add(&mut self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Done { .. } => self.done += 1,
            TaskOutcome::Skipped { .. } => self.skipped += 1,
            TaskOutcome::Failed { .. } => self.failed += 1,
            TaskOutcome::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.done + self.skipped + self.failed + self.cancelled
    }
}

/// Everything a finished run produced, in catalog order.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub reports: Vec<TaskReport>,
    pub tally: Tally,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn new(mut reports: Vec<TaskReport>, elapsed: Duration) -> Self {
        reports.sort_by_key(|r| r.index);
        let mut tally = Tally::default();
        for report in &reports {
            tally.add(&report.outcome);
        }
        Self {
            reports,
            tally,
            elapsed,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &TaskReport> {
        self.reports.iter().filter(|r| r.outcome.is_failed())
    }

    /// Report for an observation id, if it was part of the run.
    pub fn get(&self, id: &str) -> Option<&TaskReport> {
        self.reports.iter().find(|r| r.observation.as_str() == id)
    }
}

/// Live counters for a running pipeline, shared with the status server.
#[derive(Debug, Default)]
pub struct Progress {
    total: AtomicU64,
    admitted: AtomicU64,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,
    done: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset all counters at the start of a run.
    pub fn begin(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
        for counter in [
            &self.admitted,
            &self.in_flight,
            &self.max_in_flight,
            &self.done,
            &self.skipped,
            &self.failed,
            &self.cancelled,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
    }

    pub(crate) fn slot_acquired(&self) {
        self.admitted.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        gauge!("era5_tasks_in_flight").set(now as f64);
    }

    pub(crate) fn slot_released(&self) {
        let now = self.in_flight.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        gauge!("era5_tasks_in_flight").set(now as f64);
    }

    pub(crate) fn record(&self, outcome: &TaskOutcome) {
        let counter = match outcome {
            TaskOutcome::Done { .. } => &self.done,
            TaskOutcome::Skipped { .. } => &self.skipped,
            TaskOutcome::Failed { .. } => &self.failed,
            TaskOutcome::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        counter!("era5_tasks_total", "outcome" => outcome.label()).increment(1);
    }

    /// Tasks that reached a terminal state.
    pub fn completed(&self) -> u64 {
        self.done.load(Ordering::SeqCst)
            + self.skipped.load(Ordering::SeqCst)
            + self.failed.load(Ordering::SeqCst)
            + self.cancelled.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total.load(Ordering::SeqCst),
            admitted: self.admitted.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            max_in_flight: self.max_in_flight.load(Ordering::SeqCst),
            done: self.done.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
        }
    }
}

/// Point-in-time copy of [`Progress`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub total: u64,
    pub admitted: u64,
    pub in_flight: u64,
    pub max_in_flight: u64,
    pub done: u64,
    pub skipped: u64,
    pub failed: u64,
    pub cancelled: u64,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}
