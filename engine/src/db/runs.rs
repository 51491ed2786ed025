/// Refresh run history
///
/// One row per refresh run: inserted as `running` when the run starts and
/// closed as `completed` or `failed` with its counts. The history lives in
/// a local SQLite file in WAL mode so the API can list runs while a
/// refresh writes to it.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{ConnectOptions, Row};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const SCHEMA: &str = include_str!("../../migrations/001_initial.sql");

/// Run status enum
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            _ => RunStatus::Running,
        }
    }
}

/// Counts recorded when a run finishes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCounts {
    pub campaigns: i64,
    pub years_stored: i64,
    pub years_failed: i64,
    pub partitions_skipped: i64,
    pub warnings: i64,
}

/// Run record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub mode: String,
    pub status: RunStatus,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub counts: RunCounts,
    pub error: Option<String>,
}

/// Handle on the run history; clones share one pool
#[derive(Clone)]
pub struct RunRepository {
    pool: SqlitePool,
}

fn now_secs() -> Result<i64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64)
}

impl RunRepository {
    /// Open the history at `path`, creating the file and schema if needed
    ///
    /// Runs still marked `running` were cut off by an unclean shutdown or
    /// belong to another process; they are reported, not rewritten.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .disable_statement_logging();
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open run history at {}", path.display()))?;

        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .context("Failed to apply run history schema")?;

        let history = Self { pool };
        let unfinished = history.unfinished_runs().await?;
        if unfinished > 0 {
            warn!("{} refresh runs in {} never finished", unfinished, path.display());
        }
        info!("Run history at {}", path.display());
        Ok(history)
    }

    /// Checkpoint the WAL into the main file and close the pool
    pub async fn close(self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .context("Failed to checkpoint run history")?;
        self.pool.close().await;
        debug!("Run history closed");
        Ok(())
    }

    /// Runs still marked `running`
    pub async fn unfinished_runs(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM refresh_runs WHERE status = ?")
            .bind(RunStatus::Running.as_str())
            .fetch_one(&self.pool)
            .await
            .context("Failed to count unfinished runs")
    }

    /// Record the start of a run
    pub async fn start_run(&self, id: &str, mode: &str) -> Result<()> {
        let now = now_secs()?;

        sqlx::query("INSERT INTO refresh_runs (id, mode, status, started_at) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(mode)
            .bind(RunStatus::Running.as_str())
            .bind(now)
            .execute(&self.pool)
            .await
            .context("Failed to record run start")?;

        Ok(())
    }

    /// Close a run as completed
    pub async fn finish_run(&self, id: &str, counts: &RunCounts) -> Result<()> {
        let now = now_secs()?;

        sqlx::query(
            "UPDATE refresh_runs
             SET status = ?, finished_at = ?, campaigns = ?, years_stored = ?,
                 years_failed = ?, partitions_skipped = ?, warnings = ?
             WHERE id = ?",
        )
        .bind(RunStatus::Completed.as_str())
        .bind(now)
        .bind(counts.campaigns)
        .bind(counts.years_stored)
        .bind(counts.years_failed)
        .bind(counts.partitions_skipped)
        .bind(counts.warnings)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to record run completion")?;

        Ok(())
    }

    /// Close a run as failed
    pub async fn fail_run(&self, id: &str, error: &str) -> Result<()> {
        let now = now_secs()?;

        sqlx::query("UPDATE refresh_runs SET status = ?, finished_at = ?, error = ? WHERE id = ?")
            .bind(RunStatus::Failed.as_str())
            .bind(now)
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to record run failure")?;

        Ok(())
    }

    pub async fn get_run(&self, id: &str) -> Result<Option<RunRecord>> {
        let row = sqlx::query("SELECT * FROM refresh_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to get run")?;

        Ok(row.map(|r| record_from_row(&r)))
    }

    /// Most recent runs first
    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query("SELECT * FROM refresh_runs ORDER BY started_at DESC, rowid DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to get recent runs")?;

        Ok(rows.iter().map(record_from_row).collect())
    }
}

fn record_from_row(r: &sqlx::sqlite::SqliteRow) -> RunRecord {
    let status: String = r.get("status");
    RunRecord {
        id: r.get("id"),
        mode: r.get("mode"),
        status: RunStatus::parse(&status),
        started_at: r.get("started_at"),
        finished_at: r.get("finished_at"),
        counts: RunCounts {
            campaigns: r.get("campaigns"),
            years_stored: r.get("years_stored"),
            years_failed: r.get("years_failed"),
            partitions_skipped: r.get("partitions_skipped"),
            warnings: r.get("warnings"),
        },
        error: r.get("error"),
    }
}
