//! Core data model for the orchestration daemon.
//!
//! Jobs, runs, workspaces, and the agentic cycle state live here so the
//! daemon modules and any embedding binary share one vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for jobs, runs, and agentic states.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Jobs ---

/// Kind of queued work. Dispatch is a compile-time enum, not a runtime
/// registration table: every kind has a fixed handler slot in the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Initial implementation pass for a task.
    Coding,
    /// Remediation pass after a failed CI result.
    FixCi,
    /// Remediation pass after a below-threshold review.
    FixReview,
    /// Automated review pass producing a score.
    Review,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coding => "coding",
            Self::FixCi => "fix_ci",
            Self::FixReview => "fix_review",
            Self::Review => "review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "coding" => Some(Self::Coding),
            "fix_ci" => Some(Self::FixCi),
            "fix_review" => Some(Self::FixReview),
            "review" => Some(Self::Review),
            _ => None,
        }
    }

    pub const ALL: [Self; 4] = [Self::Coding, Self::FixCi, Self::FixReview, Self::Review];
}

/// Job lifecycle status.
///
/// The only permitted regression is `running -> queued` on a retryable
/// failure; every other transition moves forward or terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

/// A durable unit of work claimed and executed by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Id,
    pub kind: JobKind,
    /// Reference to the domain entity the job operates on (task id).
    pub ref_id: String,
    /// Kind-specific JSON payload.
    pub payload: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest claimable time; pushed forward on retry.
    pub available_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate queue health numbers for dashboards.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStats {
    pub queued: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub canceled: u64,
    pub oldest_queued_at: Option<DateTime<Utc>>,
    /// Average queued-to-claimed wait over recently claimed jobs, in ms.
    pub avg_wait_ms: Option<i64>,
}

// --- Runs and workspaces ---

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            "CANCELED" => Some(Self::Canceled),
            _ => None,
        }
    }
}

/// Which isolation strategy produced a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceKind {
    /// Full shallow clone, strongest isolation.
    Clone,
    /// Linked worktree off a shared repository, cheap but branch-exclusive.
    Worktree,
}

impl WorkspaceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clone => "clone",
            Self::Worktree => "worktree",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clone" => Some(Self::Clone),
            "worktree" => Some(Self::Worktree),
            _ => None,
        }
    }
}

/// An isolated git working directory exclusively owned by one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub path: String,
    pub branch_name: String,
    pub base_branch: String,
    pub kind: WorkspaceKind,
    pub created_at: DateTime<Utc>,
}

/// One execution of a coding agent against an isolated workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Id,
    pub task_id: String,
    /// Which agent CLI executed this run (e.g. "claude", "codex").
    pub executor_kind: String,
    pub workspace: Option<Workspace>,
    pub base_ref: String,
    pub status: RunStatus,
    /// Unified diff produced by the run, if any.
    pub patch: Option<String>,
    pub files_changed: Vec<String>,
    /// Agent session id for resuming a conversation across runs.
    pub session_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// --- Agentic cycle ---

/// State-machine position of an autonomous task-to-merge cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Coding,
    WaitingCi,
    Reviewing,
    FixingCi,
    FixingReview,
    AwaitingHuman,
    MergeCheck,
    Merging,
    Completed,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coding => "CODING",
            Self::WaitingCi => "WAITING_CI",
            Self::Reviewing => "REVIEWING",
            Self::FixingCi => "FIXING_CI",
            Self::FixingReview => "FIXING_REVIEW",
            Self::AwaitingHuman => "AWAITING_HUMAN",
            Self::MergeCheck => "MERGE_CHECK",
            Self::Merging => "MERGING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CODING" => Some(Self::Coding),
            "WAITING_CI" => Some(Self::WaitingCi),
            "REVIEWING" => Some(Self::Reviewing),
            "FIXING_CI" => Some(Self::FixingCi),
            "FIXING_REVIEW" => Some(Self::FixingReview),
            "AWAITING_HUMAN" => Some(Self::AwaitingHuman),
            "MERGE_CHECK" => Some(Self::MergeCheck),
            "MERGING" => Some(Self::Merging),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Phases whose work executes as a queued job under the worker.
    pub fn runs_via_job(&self) -> bool {
        matches!(
            self,
            Self::Coding | Self::FixingCi | Self::FixingReview | Self::Reviewing
        )
    }
}

/// Whether a passing merge check proceeds unattended or waits for approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveMode {
    /// Proceed from MERGE_CHECK straight to MERGING.
    FullAuto,
    /// Park at AWAITING_HUMAN and wait for an approval signal.
    SemiAuto,
}

impl Default for DriveMode {
    fn default() -> Self {
        Self::FullAuto
    }
}

/// Persisted progress record for one autonomous task-to-merge cycle.
///
/// At most one non-terminal state may exist per task at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgenticState {
    pub id: Id,
    pub task_id: String,
    pub phase: Phase,
    /// Total phase-loop iterations consumed (coding + all fix passes).
    pub iteration: u32,
    pub ci_iterations: u32,
    pub review_iterations: u32,
    pub pr_number: Option<u64>,
    pub last_ci_result: Option<CiResult>,
    pub last_review_result: Option<ReviewResult>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// --- Collaborator result types ---

/// Terminal status of a combined CI evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiStatus {
    Pending,
    Success,
    Failure,
    Error,
}

impl CiStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Result of a single named CI job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiJobResult {
    pub job_name: String,
    pub result: String,
    /// Truncated tail of the failure log, present only for failed jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_excerpt: Option<String>,
}

/// Structured terminal CI outcome handed to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiResult {
    pub success: bool,
    /// Job name to raw result string, every job included.
    pub jobs: std::collections::BTreeMap<String, String>,
    pub failed_jobs: Vec<CiJobResult>,
}

impl CiResult {
    /// Fold per-job results into a terminal outcome. Any `failure` or
    /// `error` job makes the whole result a failure.
    pub fn from_jobs(jobs: Vec<CiJobResult>) -> Self {
        let mut map = std::collections::BTreeMap::new();
        let mut failed = Vec::new();
        for job in jobs {
            map.insert(job.job_name.clone(), job.result.clone());
            if job.result != "success" && job.result != "skipped" {
                failed.push(job);
            }
        }
        Self {
            success: failed.is_empty(),
            jobs: map,
            failed_jobs: failed,
        }
    }
}

/// Outcome of an automated review pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewResult {
    /// Normalized score in `[0.0, 1.0]`.
    pub score: f64,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Result reported by an agent executor invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub patch: Option<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub logs: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// How a PR merge is performed by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    Merge,
    Squash,
    Rebase,
}

impl MergeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Squash => "squash",
            Self::Rebase => "rebase",
        }
    }
}

impl Default for MergeMethod {
    fn default() -> Self {
        Self::Squash
    }
}

/// Handle to a pull request at the provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrRef {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl std::fmt::Display for PrRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.repo, self.number)
    }
}

// --- Job payloads ---

/// Payload for `coding`, `fix_ci` and `fix_review` jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPayload {
    pub task_id: String,
    /// Instruction handed to the agent executor verbatim.
    pub instruction: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    /// Session to resume, carried from the previous run on this task.
    #[serde(default)]
    pub resume_session_id: Option<String>,
}

/// Payload for `review` jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewPayload {
    pub task_id: String,
    pub pr_number: u64,
}
