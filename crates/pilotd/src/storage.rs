//! SQLite storage for the orchestration daemon.
//!
//! Persists the two structures that must survive a restart: the jobs
//! table and the per-task agentic state, plus run records linking jobs
//! to their workspaces. The database is the locking boundary for job
//! assignment; claims are a single atomic UPDATE so concurrent worker
//! processes never receive the same job.

use chrono::{DateTime, Duration, Utc};
use pilot_core::{
    AgenticState, CiResult, Id, Job, JobKind, JobStats, JobStatus, Phase, ReviewResult, Run,
    RunStatus, Workspace, WorkspaceKind,
};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use thiserror::Error;

/// Explicit column list for jobs table queries. Explicit columns keep row
/// mapping correct regardless of column order after ALTER TABLE.
const JOBS_COLUMNS: &str = "id, kind, ref_id, payload, status, attempts, max_attempts, \
    available_at, locked_by, locked_at, error, created_at, updated_at";

const RUNS_COLUMNS: &str = "id, task_id, executor_kind, workspace_path, branch_name, \
    base_branch, workspace_kind, workspace_created_at, base_ref, status, patch, \
    files_changed, session_id, error, created_at, updated_at";

const STATE_COLUMNS: &str = "id, task_id, phase, iteration, ci_iterations, \
    review_iterations, pr_number, last_ci_result, last_review_result, error, \
    started_at, updated_at";

/// How far back the rolling average wait-time window reaches.
const STATS_WAIT_WINDOW: Duration = Duration::hours(1);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("agentic state not found: {0}")]
    StateNotFound(String),
    #[error("task {0} already has an active agentic cycle")]
    CycleActive(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend for the daemon.
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Open (or create) the database at the given path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        // WAL keeps readers unblocked while a worker writes.
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Run embedded migrations, idempotently.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    // --- Job operations ---

    /// Insert a queued job, claimable after `delay`.
    pub async fn enqueue_job(
        &self,
        kind: JobKind,
        ref_id: &str,
        payload: &str,
        max_attempts: u32,
        delay: Duration,
    ) -> Result<Id> {
        let id = Id::new();
        let now = Utc::now();
        let available_at = (now + delay).timestamp_millis();

        sqlx::query(
            r#"
            INSERT INTO jobs (id, kind, ref_id, payload, status, attempts, max_attempts,
                              available_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 'queued', 0, ?5, ?6, ?7, ?7)
            "#,
        )
        .bind(id.as_ref())
        .bind(kind.as_str())
        .bind(ref_id)
        .bind(payload)
        .bind(max_attempts as i64)
        .bind(available_at)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Atomically claim the oldest available queued job.
    ///
    /// The claim is a single UPDATE over a subselect; SQLite serializes
    /// writers, so two concurrent callers can never receive the same row.
    pub async fn claim_next_job(&self, locked_by: &str) -> Result<Option<Job>> {
        let now = Utc::now().timestamp_millis();
        let query = format!(
            r#"
            UPDATE jobs
            SET status = 'running', attempts = attempts + 1,
                locked_by = ?1, locked_at = ?2, updated_at = ?2
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'queued' AND available_at <= ?2
                ORDER BY created_at ASC, id ASC
                LIMIT 1
            )
            RETURNING {JOBS_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(locked_by)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(JobRow::into_job))
    }

    /// Get a job by id.
    pub async fn get_job(&self, id: &Id) -> Result<Job> {
        let query = format!("SELECT {JOBS_COLUMNS} FROM jobs WHERE id = ?1");
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::JobNotFound(id.to_string()))?;
        Ok(row.into_job())
    }

    /// List jobs for a (kind, ref_id) pair, newest first.
    pub async fn list_jobs_by_ref(&self, kind: JobKind, ref_id: &str) -> Result<Vec<Job>> {
        let query = format!(
            "SELECT {JOBS_COLUMNS} FROM jobs WHERE kind = ?1 AND ref_id = ?2 \
             ORDER BY created_at DESC"
        );
        let rows = sqlx::query_as::<_, JobRow>(&query)
            .bind(kind.as_str())
            .bind(ref_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(JobRow::into_job).collect())
    }

    /// Mark a running job succeeded.
    pub async fn complete_job(&self, id: &Id) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE jobs SET status = 'succeeded', updated_at = ?1 WHERE id = ?2",
        )
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::JobNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Record a failure. Requeues with a delay while attempts remain,
    /// otherwise the job becomes terminally failed.
    ///
    /// Returns the resulting status.
    pub async fn fail_job(
        &self,
        id: &Id,
        error: &str,
        retry_delay: Duration,
    ) -> Result<JobStatus> {
        let job = self.get_job(id).await?;
        let now = Utc::now();

        let status = if job.attempts < job.max_attempts {
            JobStatus::Queued
        } else {
            JobStatus::Failed
        };
        let available_at = match status {
            JobStatus::Queued => (now + retry_delay).timestamp_millis(),
            _ => job.available_at.timestamp_millis(),
        };

        let result = sqlx::query(
            "UPDATE jobs SET status = ?1, available_at = ?2, error = ?3, \
             locked_by = NULL, locked_at = NULL, updated_at = ?4 WHERE id = ?5",
        )
        .bind(status.as_str())
        .bind(available_at)
        .bind(error)
        .bind(now.timestamp_millis())
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::JobNotFound(id.to_string()));
        }
        Ok(status)
    }

    /// Cancel a job. Only queued jobs transition here; a running job must
    /// additionally be stopped by the worker holding it.
    ///
    /// Returns true if the row was canceled.
    pub async fn cancel_job(&self, id: &Id) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE jobs SET status = 'canceled', updated_at = ?1 \
             WHERE id = ?2 AND status = 'queued'",
        )
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Cancel all queued jobs for a (kind, ref_id) pair. Returns the count.
    pub async fn cancel_jobs_by_ref(&self, kind: JobKind, ref_id: &str) -> Result<u64> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE jobs SET status = 'canceled', updated_at = ?1 \
             WHERE kind = ?2 AND ref_id = ?3 AND status = 'queued'",
        )
        .bind(now)
        .bind(kind.as_str())
        .bind(ref_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Mark a running job canceled. Used by the worker after it has
    /// stopped the in-flight task backing the job.
    pub async fn mark_job_canceled(&self, id: &Id) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE jobs SET status = 'canceled', locked_by = NULL, locked_at = NULL, \
             updated_at = ?1 WHERE id = ?2",
        )
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::JobNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Force every running job to failed. Called once at process startup:
    /// the in-process state behind a running row is unrecoverable after a
    /// crash, so we never resume.
    ///
    /// Returns the number of rows affected.
    pub async fn fail_all_running(&self, error: &str) -> Result<u64> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE jobs SET status = 'failed', error = ?1, locked_by = NULL, \
             locked_at = NULL, updated_at = ?2 WHERE status = 'running'",
        )
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Per-status counts plus queue-age indicators for health dashboards.
    pub async fn job_stats(&self) -> Result<JobStats> {
        let counts: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = JobStats::default();
        for (status, count) in counts {
            let count = count as u64;
            match status.as_str() {
                "queued" => stats.queued = count,
                "running" => stats.running = count,
                "succeeded" => stats.succeeded = count,
                "failed" => stats.failed = count,
                "canceled" => stats.canceled = count,
                _ => {}
            }
        }

        let oldest: Option<(i64,)> = sqlx::query_as(
            "SELECT MIN(created_at) FROM jobs WHERE status = 'queued' \
             HAVING MIN(created_at) IS NOT NULL",
        )
        .fetch_optional(&self.pool)
        .await?;
        stats.oldest_queued_at = oldest.and_then(|(ts,)| DateTime::from_timestamp_millis(ts));

        let window_start = (Utc::now() - STATS_WAIT_WINDOW).timestamp_millis();
        let avg: Option<(Option<f64>,)> = sqlx::query_as(
            "SELECT AVG(locked_at - created_at) FROM jobs \
             WHERE locked_at IS NOT NULL AND locked_at >= ?1",
        )
        .bind(window_start)
        .fetch_optional(&self.pool)
        .await?;
        stats.avg_wait_ms = avg.and_then(|(v,)| v).map(|v| v as i64);

        Ok(stats)
    }

    /// Delete terminal job rows older than the cutoff. Returns the count.
    pub async fn delete_terminal_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE status IN ('succeeded', 'failed', 'canceled') \
             AND updated_at < ?1",
        )
        .bind(cutoff.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // --- Run operations ---

    /// Insert a new run.
    pub async fn insert_run(&self, run: &Run) -> Result<()> {
        let (ws_path, ws_branch, ws_base, ws_kind, ws_created) = match &run.workspace {
            Some(ws) => (
                Some(ws.path.as_str()),
                Some(ws.branch_name.as_str()),
                Some(ws.base_branch.as_str()),
                Some(ws.kind.as_str()),
                Some(ws.created_at.timestamp_millis()),
            ),
            None => (None, None, None, None, None),
        };
        let files_changed = serde_json::to_string(&run.files_changed)?;

        sqlx::query(
            r#"
            INSERT INTO runs (id, task_id, executor_kind, workspace_path, branch_name,
                              base_branch, workspace_kind, workspace_created_at, base_ref,
                              status, patch, files_changed, session_id, error,
                              created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
        )
        .bind(run.id.as_ref())
        .bind(&run.task_id)
        .bind(&run.executor_kind)
        .bind(ws_path)
        .bind(ws_branch)
        .bind(ws_base)
        .bind(ws_kind)
        .bind(ws_created)
        .bind(&run.base_ref)
        .bind(run.status.as_str())
        .bind(&run.patch)
        .bind(files_changed)
        .bind(&run.session_id)
        .bind(&run.error)
        .bind(run.created_at.timestamp_millis())
        .bind(run.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a run by id.
    pub async fn get_run(&self, id: &Id) -> Result<Run> {
        let query = format!("SELECT {RUNS_COLUMNS} FROM runs WHERE id = ?1");
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::RunNotFound(id.to_string()))?;
        Ok(row.into_run())
    }

    /// Most recent run for a task, if any. Used for workspace reuse and
    /// session resumption across sequential runs.
    pub async fn latest_run_for_task(&self, task_id: &str) -> Result<Option<Run>> {
        let query = format!(
            "SELECT {RUNS_COLUMNS} FROM runs WHERE task_id = ?1 \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(RunRow::into_run))
    }

    /// Update run status, optionally recording an error.
    pub async fn update_run_status(
        &self,
        id: &Id,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE runs SET status = ?1, error = COALESCE(?2, error), updated_at = ?3 \
             WHERE id = ?4",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Attach the workspace a run is executing in.
    pub async fn set_run_workspace(&self, id: &Id, workspace: &Workspace) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE runs SET workspace_path = ?1, branch_name = ?2, base_branch = ?3, \
             workspace_kind = ?4, workspace_created_at = ?5, updated_at = ?6 WHERE id = ?7",
        )
        .bind(&workspace.path)
        .bind(&workspace.branch_name)
        .bind(&workspace.base_branch)
        .bind(workspace.kind.as_str())
        .bind(workspace.created_at.timestamp_millis())
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Persist the patch artifact produced by a run.
    pub async fn record_run_result(
        &self,
        id: &Id,
        patch: Option<&str>,
        files_changed: &[String],
        session_id: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let files = serde_json::to_string(files_changed)?;
        let result = sqlx::query(
            "UPDATE runs SET patch = ?1, files_changed = ?2, \
             session_id = COALESCE(?3, session_id), updated_at = ?4 WHERE id = ?5",
        )
        .bind(patch)
        .bind(files)
        .bind(session_id)
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    // --- Agentic state operations ---

    /// Insert a new cycle state. Rejected while a non-terminal state for
    /// the same task exists (partial unique index).
    pub async fn insert_state(&self, state: &AgenticState) -> Result<()> {
        let last_ci = state
            .last_ci_result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let last_review = state
            .last_review_result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO agentic_state (id, task_id, phase, iteration, ci_iterations,
                                       review_iterations, pr_number, last_ci_result,
                                       last_review_result, error, started_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(state.id.as_ref())
        .bind(&state.task_id)
        .bind(state.phase.as_str())
        .bind(state.iteration as i64)
        .bind(state.ci_iterations as i64)
        .bind(state.review_iterations as i64)
        .bind(state.pr_number.map(|n| n as i64))
        .bind(last_ci)
        .bind(last_review)
        .bind(&state.error)
        .bind(state.started_at.timestamp_millis())
        .bind(state.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(StorageError::CycleActive(state.task_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Get a cycle state by id.
    pub async fn get_state(&self, id: &Id) -> Result<AgenticState> {
        let query = format!("SELECT {STATE_COLUMNS} FROM agentic_state WHERE id = ?1");
        let row = sqlx::query_as::<_, StateRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::StateNotFound(id.to_string()))?;
        row.into_state()
    }

    /// The non-terminal cycle state for a task, if one exists.
    pub async fn active_state_for_task(&self, task_id: &str) -> Result<Option<AgenticState>> {
        let query = format!(
            "SELECT {STATE_COLUMNS} FROM agentic_state \
             WHERE task_id = ?1 AND phase NOT IN ('COMPLETED', 'FAILED')"
        );
        let row = sqlx::query_as::<_, StateRow>(&query)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(StateRow::into_state).transpose()
    }

    /// All non-terminal cycle states. Used by startup recovery.
    pub async fn list_active_states(&self) -> Result<Vec<AgenticState>> {
        let query = format!(
            "SELECT {STATE_COLUMNS} FROM agentic_state \
             WHERE phase NOT IN ('COMPLETED', 'FAILED') ORDER BY started_at ASC"
        );
        let rows = sqlx::query_as::<_, StateRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(StateRow::into_state).collect()
    }

    /// Persist the full mutable portion of a cycle state.
    pub async fn update_state(&self, state: &AgenticState) -> Result<()> {
        let last_ci = state
            .last_ci_result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let last_review = state
            .last_review_result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let now = Utc::now().timestamp_millis();

        let result = sqlx::query(
            "UPDATE agentic_state SET phase = ?1, iteration = ?2, ci_iterations = ?3, \
             review_iterations = ?4, pr_number = ?5, last_ci_result = ?6, \
             last_review_result = ?7, error = ?8, updated_at = ?9 WHERE id = ?10",
        )
        .bind(state.phase.as_str())
        .bind(state.iteration as i64)
        .bind(state.ci_iterations as i64)
        .bind(state.review_iterations as i64)
        .bind(state.pr_number.map(|n| n as i64))
        .bind(last_ci)
        .bind(last_review)
        .bind(&state.error)
        .bind(now)
        .bind(state.id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::StateNotFound(state.id.to_string()));
        }
        Ok(())
    }
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    kind: String,
    ref_id: String,
    payload: String,
    status: String,
    attempts: i64,
    max_attempts: i64,
    available_at: i64,
    locked_by: Option<String>,
    locked_at: Option<i64>,
    error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl JobRow {
    fn into_job(self) -> Job {
        Job {
            id: Id::from_string(self.id),
            kind: JobKind::parse(&self.kind).unwrap_or(JobKind::Coding),
            ref_id: self.ref_id,
            payload: self.payload,
            status: match self.status.as_str() {
                "queued" => JobStatus::Queued,
                "running" => JobStatus::Running,
                "succeeded" => JobStatus::Succeeded,
                "canceled" => JobStatus::Canceled,
                _ => JobStatus::Failed,
            },
            attempts: self.attempts as u32,
            max_attempts: self.max_attempts as u32,
            available_at: DateTime::from_timestamp_millis(self.available_at).unwrap_or_default(),
            locked_by: self.locked_by,
            locked_at: self.locked_at.and_then(DateTime::from_timestamp_millis),
            error: self.error,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    task_id: String,
    executor_kind: String,
    workspace_path: Option<String>,
    branch_name: Option<String>,
    base_branch: Option<String>,
    workspace_kind: Option<String>,
    workspace_created_at: Option<i64>,
    base_ref: String,
    status: String,
    patch: Option<String>,
    files_changed: String,
    session_id: Option<String>,
    error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RunRow {
    fn into_run(self) -> Run {
        let workspace = match (self.workspace_path, self.branch_name, self.base_branch) {
            (Some(path), Some(branch), Some(base)) => Some(Workspace {
                path,
                branch_name: branch,
                base_branch: base,
                kind: self
                    .workspace_kind
                    .as_deref()
                    .and_then(WorkspaceKind::parse)
                    .unwrap_or(WorkspaceKind::Clone),
                created_at: self
                    .workspace_created_at
                    .and_then(DateTime::from_timestamp_millis)
                    .unwrap_or_default(),
            }),
            _ => None,
        };

        Run {
            id: Id::from_string(self.id),
            task_id: self.task_id,
            executor_kind: self.executor_kind,
            workspace,
            base_ref: self.base_ref,
            status: RunStatus::parse(&self.status).unwrap_or(RunStatus::Failed),
            patch: self.patch,
            files_changed: serde_json::from_str(&self.files_changed).unwrap_or_default(),
            session_id: self.session_id,
            error: self.error,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct StateRow {
    id: String,
    task_id: String,
    phase: String,
    iteration: i64,
    ci_iterations: i64,
    review_iterations: i64,
    pr_number: Option<i64>,
    last_ci_result: Option<String>,
    last_review_result: Option<String>,
    error: Option<String>,
    started_at: i64,
    updated_at: i64,
}

impl StateRow {
    fn into_state(self) -> Result<AgenticState> {
        let last_ci_result: Option<CiResult> = self
            .last_ci_result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let last_review_result: Option<ReviewResult> = self
            .last_review_result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(AgenticState {
            id: Id::from_string(self.id),
            task_id: self.task_id,
            phase: Phase::parse(&self.phase).unwrap_or(Phase::Failed),
            iteration: self.iteration as u32,
            ci_iterations: self.ci_iterations as u32,
            review_iterations: self.review_iterations as u32,
            pr_number: self.pr_number.map(|n| n as u64),
            last_ci_result,
            last_review_result,
            error: self.error,
            started_at: DateTime::from_timestamp_millis(self.started_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct TestStorage {
        storage: Storage,
        _dir: TempDir, // Keep alive to prevent cleanup
    }

    async fn create_test_storage() -> TestStorage {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        TestStorage { storage, _dir: dir }
    }

    async fn enqueue(ts: &TestStorage, ref_id: &str, max_attempts: u32) -> Id {
        ts.storage
            .enqueue_job(JobKind::Coding, ref_id, "{}", max_attempts, Duration::zero())
            .await
            .unwrap()
    }

    fn create_test_run(task_id: &str) -> Run {
        let now = Utc::now();
        Run {
            id: Id::new(),
            task_id: task_id.to_string(),
            executor_kind: "claude".to_string(),
            workspace: None,
            base_ref: "main".to_string(),
            status: RunStatus::Pending,
            patch: None,
            files_changed: Vec::new(),
            session_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn create_test_state(task_id: &str, phase: Phase) -> AgenticState {
        let now = Utc::now();
        AgenticState {
            id: Id::new(),
            task_id: task_id.to_string(),
            phase,
            iteration: 0,
            ci_iterations: 0,
            review_iterations: 0,
            pr_number: None,
            last_ci_result: None,
            last_review_result: None,
            error: None,
            started_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn migrate_embedded_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();

        storage.migrate_embedded().await.unwrap();
        storage.migrate_embedded().await.unwrap();

        storage
            .enqueue_job(JobKind::Coding, "task-1", "{}", 1, Duration::zero())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn claim_returns_oldest_first() {
        let ts = create_test_storage().await;
        let a = enqueue(&ts, "task-a", 1).await;
        let b = enqueue(&ts, "task-b", 1).await;
        let c = enqueue(&ts, "task-c", 1).await;

        let first = ts.storage.claim_next_job("w1").await.unwrap().unwrap();
        let second = ts.storage.claim_next_job("w1").await.unwrap().unwrap();
        let third = ts.storage.claim_next_job("w1").await.unwrap().unwrap();

        assert_eq!(first.id, a);
        assert_eq!(second.id, b);
        assert_eq!(third.id, c);
        assert!(ts.storage.claim_next_job("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_sets_lock_fields_and_attempts() {
        let ts = create_test_storage().await;
        enqueue(&ts, "task-1", 3).await;

        let job = ts.storage.claim_next_job("worker-7").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.locked_by.as_deref(), Some("worker-7"));
        assert!(job.locked_at.is_some());
    }

    #[tokio::test]
    async fn completing_one_job_leaves_others_untouched() {
        let ts = create_test_storage().await;
        let a = enqueue(&ts, "task-a", 1).await;
        let b = enqueue(&ts, "task-b", 1).await;
        let c = enqueue(&ts, "task-c", 1).await;

        // Claim and complete B only (A and C stay queued after re-enqueue order).
        ts.storage.claim_next_job("w1").await.unwrap().unwrap(); // A
        let claimed_b = ts.storage.claim_next_job("w1").await.unwrap().unwrap();
        assert_eq!(claimed_b.id, b);
        ts.storage.complete_job(&b).await.unwrap();

        assert_eq!(ts.storage.get_job(&a).await.unwrap().status, JobStatus::Running);
        assert_eq!(ts.storage.get_job(&b).await.unwrap().status, JobStatus::Succeeded);
        assert_eq!(ts.storage.get_job(&c).await.unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_job() {
        let ts = Arc::new(create_test_storage().await);
        for i in 0..10 {
            enqueue(&ts, &format!("task-{i}"), 1).await;
        }

        let mut handles = Vec::new();
        for w in 0..10 {
            let ts = Arc::clone(&ts);
            handles.push(tokio::spawn(async move {
                ts.storage.claim_next_job(&format!("w{w}")).await.unwrap()
            }));
        }

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            if let Some(job) = handle.await.unwrap() {
                assert!(seen.insert(job.id.0.clone()), "job claimed twice");
            }
        }
        assert_eq!(seen.len(), 10);
    }

    #[tokio::test]
    async fn fail_with_remaining_attempts_requeues_with_delay() {
        let ts = create_test_storage().await;
        let id = enqueue(&ts, "task-1", 2).await;
        ts.storage.claim_next_job("w1").await.unwrap().unwrap();

        let status = ts
            .storage
            .fail_job(&id, "boom", Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Queued);

        let job = ts.storage.get_job(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert!(job.available_at > Utc::now());
        assert!(job.locked_by.is_none());

        // Not claimable before the retry delay elapses.
        assert!(ts.storage.claim_next_job("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fail_at_max_attempts_is_terminal() {
        let ts = create_test_storage().await;
        let id = enqueue(&ts, "task-1", 1).await;
        ts.storage.claim_next_job("w1").await.unwrap().unwrap();

        let status = ts
            .storage
            .fail_job(&id, "boom", Duration::zero())
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Failed);

        // Terminally failed rows are never claimable again.
        assert!(ts.storage.claim_next_job("w1").await.unwrap().is_none());
        let job = ts.storage.get_job(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn requeued_job_is_claimable_after_delay() {
        let ts = create_test_storage().await;
        let id = enqueue(&ts, "task-1", 2).await;
        ts.storage.claim_next_job("w1").await.unwrap().unwrap();
        ts.storage
            .fail_job(&id, "boom", Duration::zero())
            .await
            .unwrap();

        let reclaimed = ts.storage.claim_next_job("w2").await.unwrap().unwrap();
        assert_eq!(reclaimed.id, id);
        assert_eq!(reclaimed.attempts, 2);
    }

    #[tokio::test]
    async fn delayed_enqueue_is_not_immediately_claimable() {
        let ts = create_test_storage().await;
        ts.storage
            .enqueue_job(JobKind::Coding, "task-1", "{}", 1, Duration::seconds(300))
            .await
            .unwrap();

        assert!(ts.storage.claim_next_job("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_only_affects_queued_jobs() {
        let ts = create_test_storage().await;
        let queued = enqueue(&ts, "task-a", 1).await;
        let running = enqueue(&ts, "task-b", 1).await;
        let claimed = ts.storage.claim_next_job("w1").await.unwrap().unwrap();
        assert_eq!(claimed.id, queued);

        // `queued` is now running; `running` id is still queued.
        assert!(!ts.storage.cancel_job(&queued).await.unwrap());
        assert!(ts.storage.cancel_job(&running).await.unwrap());
        assert_eq!(
            ts.storage.get_job(&running).await.unwrap().status,
            JobStatus::Canceled
        );
    }

    #[tokio::test]
    async fn cancel_by_ref_cancels_all_queued_matches() {
        let ts = create_test_storage().await;
        enqueue(&ts, "task-1", 1).await;
        enqueue(&ts, "task-1", 1).await;
        enqueue(&ts, "task-2", 1).await;

        let count = ts
            .storage
            .cancel_jobs_by_ref(JobKind::Coding, "task-1")
            .await
            .unwrap();
        assert_eq!(count, 2);

        let stats = ts.storage.job_stats().await.unwrap();
        assert_eq!(stats.canceled, 2);
        assert_eq!(stats.queued, 1);
    }

    #[tokio::test]
    async fn fail_all_running_leaves_no_running_rows() {
        let ts = create_test_storage().await;
        enqueue(&ts, "task-a", 1).await;
        enqueue(&ts, "task-b", 1).await;
        enqueue(&ts, "task-c", 1).await;
        ts.storage.claim_next_job("w1").await.unwrap().unwrap();
        ts.storage.claim_next_job("w1").await.unwrap().unwrap();

        let count = ts.storage.fail_all_running("restarted").await.unwrap();
        assert_eq!(count, 2);

        let stats = ts.storage.job_stats().await.unwrap();
        assert_eq!(stats.running, 0);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.queued, 1);
    }

    #[tokio::test]
    async fn job_stats_reports_oldest_queued_and_wait() {
        let ts = create_test_storage().await;
        let id = enqueue(&ts, "task-1", 1).await;
        enqueue(&ts, "task-2", 1).await;

        let stats = ts.storage.job_stats().await.unwrap();
        assert_eq!(stats.queued, 2);
        assert!(stats.oldest_queued_at.is_some());
        assert!(stats.avg_wait_ms.is_none());

        ts.storage.claim_next_job("w1").await.unwrap().unwrap();
        let stats = ts.storage.job_stats().await.unwrap();
        assert_eq!(stats.running, 1);
        assert!(stats.avg_wait_ms.is_some());

        ts.storage.complete_job(&id).await.unwrap();
        let stats = ts.storage.job_stats().await.unwrap();
        assert_eq!(stats.succeeded, 1);
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_terminal_rows() {
        let ts = create_test_storage().await;
        let done = enqueue(&ts, "task-a", 1).await;
        enqueue(&ts, "task-b", 1).await;
        ts.storage.claim_next_job("w1").await.unwrap().unwrap();
        ts.storage.complete_job(&done).await.unwrap();

        // Cutoff in the future removes the terminal row, keeps the queued one.
        let removed = ts
            .storage
            .delete_terminal_jobs_before(Utc::now() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let stats = ts.storage.job_stats().await.unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.succeeded, 0);
    }

    #[tokio::test]
    async fn run_round_trip_with_workspace() {
        let ts = create_test_storage().await;
        let mut run = create_test_run("task-1");
        run.workspace = Some(Workspace {
            path: "/tmp/ws/task-1".to_string(),
            branch_name: "pilot/task-1".to_string(),
            base_branch: "main".to_string(),
            kind: WorkspaceKind::Worktree,
            created_at: Utc::now(),
        });
        run.files_changed = vec!["src/lib.rs".to_string()];

        ts.storage.insert_run(&run).await.unwrap();
        let retrieved = ts.storage.get_run(&run.id).await.unwrap();

        let ws = retrieved.workspace.unwrap();
        assert_eq!(ws.branch_name, "pilot/task-1");
        assert_eq!(ws.kind, WorkspaceKind::Worktree);
        assert_eq!(retrieved.files_changed, vec!["src/lib.rs".to_string()]);
    }

    #[tokio::test]
    async fn latest_run_for_task_picks_newest() {
        let ts = create_test_storage().await;
        let older = create_test_run("task-1");
        ts.storage.insert_run(&older).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newer = create_test_run("task-1");
        ts.storage.insert_run(&newer).await.unwrap();

        let latest = ts.storage.latest_run_for_task("task-1").await.unwrap().unwrap();
        assert_eq!(latest.id, newer.id);
        assert!(ts.storage.latest_run_for_task("task-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn record_run_result_persists_patch() {
        let ts = create_test_storage().await;
        let run = create_test_run("task-1");
        ts.storage.insert_run(&run).await.unwrap();

        ts.storage
            .record_run_result(
                &run.id,
                Some("diff --git a/x b/x"),
                &["x".to_string()],
                Some("sess-1"),
            )
            .await
            .unwrap();

        let retrieved = ts.storage.get_run(&run.id).await.unwrap();
        assert_eq!(retrieved.patch.as_deref(), Some("diff --git a/x b/x"));
        assert_eq!(retrieved.session_id.as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn second_active_cycle_for_task_is_rejected() {
        let ts = create_test_storage().await;
        let first = create_test_state("task-1", Phase::Coding);
        ts.storage.insert_state(&first).await.unwrap();

        let second = create_test_state("task-1", Phase::Coding);
        let result = ts.storage.insert_state(&second).await;
        assert!(matches!(result, Err(StorageError::CycleActive(_))));
    }

    #[tokio::test]
    async fn new_cycle_allowed_after_terminal_state() {
        let ts = create_test_storage().await;
        let mut first = create_test_state("task-1", Phase::Coding);
        ts.storage.insert_state(&first).await.unwrap();

        first.phase = Phase::Failed;
        first.error = Some("budget exceeded".to_string());
        ts.storage.update_state(&first).await.unwrap();

        let second = create_test_state("task-1", Phase::Coding);
        ts.storage.insert_state(&second).await.unwrap();
        assert!(ts
            .storage
            .active_state_for_task("task-1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn state_result_blobs_round_trip() {
        let ts = create_test_storage().await;
        let mut state = create_test_state("task-1", Phase::WaitingCi);
        state.pr_number = Some(42);
        state.last_ci_result = Some(CiResult::from_jobs(vec![pilot_core::CiJobResult {
            job_name: "build".to_string(),
            result: "failure".to_string(),
            log_excerpt: Some("error".to_string()),
        }]));
        state.last_review_result = Some(ReviewResult {
            score: 0.8,
            summary: Some("looks good".to_string()),
        });
        ts.storage.insert_state(&state).await.unwrap();

        let retrieved = ts.storage.get_state(&state.id).await.unwrap();
        assert_eq!(retrieved.pr_number, Some(42));
        let ci = retrieved.last_ci_result.unwrap();
        assert!(!ci.success);
        assert_eq!(ci.failed_jobs[0].job_name, "build");
        let review = retrieved.last_review_result.unwrap();
        assert!((review.score - 0.8).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn list_active_states_excludes_terminal() {
        let ts = create_test_storage().await;
        ts.storage
            .insert_state(&create_test_state("task-1", Phase::WaitingCi))
            .await
            .unwrap();
        let mut done = create_test_state("task-2", Phase::Coding);
        ts.storage.insert_state(&done).await.unwrap();
        done.phase = Phase::Completed;
        ts.storage.update_state(&done).await.unwrap();

        let active = ts.storage.list_active_states().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].task_id, "task-1");
    }

    #[tokio::test]
    async fn get_missing_rows_report_not_found() {
        let ts = create_test_storage().await;
        let missing = Id::new();

        assert!(matches!(
            ts.storage.get_job(&missing).await,
            Err(StorageError::JobNotFound(_))
        ));
        assert!(matches!(
            ts.storage.get_run(&missing).await,
            Err(StorageError::RunNotFound(_))
        ));
        assert!(matches!(
            ts.storage.get_state(&missing).await,
            Err(StorageError::StateNotFound(_))
        ));
    }
}
