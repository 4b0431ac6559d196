//! Run outcome persistence using SQLite with sqlx.
//!
//! The filesystem cache decides what still needs work; the ledger only keeps
//! a history of runs and per-observation failures for the status API.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use era5_prep::{BatchReport, TaskOutcome};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{error, info};

/// One finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: i64,
    pub finished_at: DateTime<Utc>,
    pub instrument: String,
    pub total: i64,
    pub done: i64,
    pub skipped: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub elapsed_secs: f64,
}

/// One failed observation.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub run_id: i64,
    pub observation: String,
    pub path: String,
    pub stage: String,
    pub error_kind: String,
    pub message: String,
}

/// Persistent run history.
pub struct OutcomeLedger {
    pool: SqlitePool,
}

impl OutcomeLedger {
    /// Open or create the ledger database at the given path.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to open SQLite database")?;

        create_tables(&pool).await?;
        info!(path = %path.display(), "Opened outcome ledger");

        Ok(Self { pool })
    }

    /// Open an in-memory database (for testing).
    pub async fn open_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        create_tables(&pool).await?;
        Ok(Self { pool })
    }

    /// Store a finished run and the outcome of each observation in it.
    pub async fn record_run(&self, instrument: &str, report: &BatchReport) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let tally = &report.tally;
        let mut tx = self.pool.begin().await?;

        let run_id = sqlx::query(
            r#"
            INSERT INTO runs (finished_at, instrument, total, done, skipped, failed, cancelled, elapsed_secs)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&now)
        .bind(instrument)
        .bind(tally.total() as i64)
        .bind(tally.done as i64)
        .bind(tally.skipped as i64)
        .bind(tally.failed as i64)
        .bind(tally.cancelled as i64)
        .bind(report.elapsed.as_secs_f64())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for task in &report.reports {
            let fetched = match &task.outcome {
                TaskOutcome::Done { fetched, .. } => Some(
                    fetched
                        .iter()
                        .map(|kind| kind.as_str())
                        .collect::<Vec<_>>()
                        .join(","),
                ),
                _ => None,
            };
            let (stage, error_kind, message) = match &task.outcome {
                TaskOutcome::Failed {
                    stage,
                    error_kind,
                    message,
                } => (Some(stage.as_str()), Some(error_kind.as_str()), Some(message.as_str())),
                _ => (None, None, None),
            };

            sqlx::query(
                r#"
                INSERT INTO outcomes (run_id, observation, path, status, fetched, stage, error_kind, message, elapsed_secs)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(run_id)
            .bind(task.observation.as_str())
            .bind(task.path.display().to_string())
            .bind(task.outcome.label())
            .bind(fetched)
            .bind(stage)
            .bind(error_kind)
            .bind(message)
            .bind(task.elapsed.as_secs_f64())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(run_id)
    }

    /// Record a run, logging instead of failing. The cache on disk already
    /// holds the run's results; losing its history is not fatal.
    pub async fn record_or_log(&self, instrument: &str, report: &BatchReport) -> Option<i64> {
        match self.record_run(instrument, report).await {
            Ok(run_id) => Some(run_id),
            Err(e) => {
                error!(error = %e, instrument = %instrument, "Failed to record run outcome");
                None
            }
        }
    }

    /// Most recent runs, newest first.
    pub async fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let rows: Vec<(i64, String, String, i64, i64, i64, i64, i64, f64)> = sqlx::query_as(
            r#"
            SELECT id, finished_at, instrument, total, done, skipped, failed, cancelled, elapsed_secs
            FROM runs
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| RunRecord {
                id: row.0,
                finished_at: DateTime::parse_from_rfc3339(&row.1)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                instrument: row.2,
                total: row.3,
                done: row.4,
                skipped: row.5,
                failed: row.6,
                cancelled: row.7,
                elapsed_secs: row.8,
            })
            .collect())
    }

    /// Most recent failed observations across runs, newest first.
    pub async fn recent_failures(&self, limit: usize) -> Result<Vec<FailureRecord>> {
        let rows: Vec<(i64, String, String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT run_id, observation, path, stage, error_kind, message
            FROM outcomes
            WHERE status = 'failed'
            ORDER BY run_id DESC, id ASC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| FailureRecord {
                run_id: row.0,
                observation: row.1,
                path: row.2,
                stage: row.3,
                error_kind: row.4,
                message: row.5,
            })
            .collect())
    }

    /// Number of recorded runs in which the observation failed.
    pub async fn failure_count(&self, observation: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM outcomes WHERE observation = ? AND status = 'failed'",
        )
        .bind(observation)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}

async fn create_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            finished_at TEXT NOT NULL,
            instrument TEXT NOT NULL,
            total INTEGER NOT NULL,
            done INTEGER NOT NULL,
            skipped INTEGER NOT NULL,
            failed INTEGER NOT NULL,
            cancelled INTEGER NOT NULL,
            elapsed_secs REAL NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS outcomes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id INTEGER NOT NULL REFERENCES runs(id),
            observation TEXT NOT NULL,
            path TEXT NOT NULL,
            status TEXT NOT NULL,
            fetched TEXT,
            stage TEXT,
            error_kind TEXT,
            message TEXT,
            elapsed_secs REAL NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_outcomes_status ON outcomes(status)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_outcomes_observation ON outcomes(observation)")
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use era5_prep::{ObservationId, TaskReport, TaskState};
    use std::path::PathBuf;
    use std::time::Duration;

    fn report(id: &str, index: usize, outcome: TaskOutcome) -> TaskReport {
        TaskReport {
            index,
            observation: ObservationId::new(id),
            path: PathBuf::from(format!("/data/{}_20191106-0530.nc", id)),
            outcome,
            elapsed: Duration::from_millis(250),
        }
    }

    fn sample_batch() -> BatchReport {
        BatchReport::new(
            vec![
                report(
                    "20191105-2130",
                    0,
                    TaskOutcome::Done {
                        fetched: vec![],
                        interpolated: false,
                    },
                ),
                report(
                    "20191106-0100",
                    1,
                    TaskOutcome::Failed {
                        stage: TaskState::Fetching,
                        error_kind: "fetch".to_string(),
                        message: "HTTP 503".to_string(),
                    },
                ),
                report(
                    "20191107-0200",
                    2,
                    TaskOutcome::Skipped {
                        duration_hours: 2.0,
                    },
                ),
            ],
            Duration::from_secs(12),
        )
    }

    #[tokio::test]
    async fn test_record_and_list_runs() {
        let ledger = OutcomeLedger::open_memory().await.unwrap();

        let first = ledger.record_run("CORAL", &sample_batch()).await.unwrap();
        let second = ledger.record_run("CORAL", &sample_batch()).await.unwrap();
        assert!(second > first);

        let runs = ledger.recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, second);
        assert_eq!(runs[0].total, 3);
        assert_eq!(runs[0].done, 1);
        assert_eq!(runs[0].failed, 1);
        assert_eq!(runs[0].skipped, 1);
        assert_eq!(runs[0].elapsed_secs, 12.0);

        assert_eq!(ledger.recent_runs(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_listed_with_stage() {
        let ledger = OutcomeLedger::open_memory().await.unwrap();
        ledger.record_run("CORAL", &sample_batch()).await.unwrap();

        let failures = ledger.recent_failures(10).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].observation, "20191106-0100");
        assert_eq!(failures[0].stage, "fetching");
        assert_eq!(failures[0].error_kind, "fetch");

        assert_eq!(ledger.failure_count("20191106-0100").await.unwrap(), 1);
        assert_eq!(ledger.failure_count("20191105-2130").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_record_or_log_survives_ledger_failure() {
        let ledger = OutcomeLedger::open_memory().await.unwrap();
        assert!(ledger.record_or_log("CORAL", &sample_batch()).await.is_some());

        ledger.pool.close().await;
        assert!(ledger.record_run("CORAL", &sample_batch()).await.is_err());
        assert_eq!(ledger.record_or_log("CORAL", &sample_batch()).await, None);
    }

    #[tokio::test]
    async fn test_open_on_disk_is_reusable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("ledger.db");

        {
            let ledger = OutcomeLedger::open(&path).await.unwrap();
            ledger.record_run("TELMA", &sample_batch()).await.unwrap();
        }

        let ledger = OutcomeLedger::open(&path).await.unwrap();
        let runs = ledger.recent_runs(5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].instrument, "TELMA");
    }
}
