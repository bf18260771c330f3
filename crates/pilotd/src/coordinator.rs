//! Run execution coordinator: glue between the job worker and the
//! workspace layer.
//!
//! A run is one agent invocation against an isolated workspace. The
//! coordinator acquires (or reuses) the workspace, invokes the agent,
//! captures the resulting patch, commits and pushes it, and drives the
//! agent through one conflict-resolution attempt when the push loses a
//! race against a concurrent push to the same branch.

use pilot_core::{Id, ReviewPayload, ReviewResult, Run, RunPayload, RunStatus, Workspace};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::executor::{AgentExecutor, ExecutionRequest, ExecutorError};
use crate::storage::{Storage, StorageError};
use crate::workspace::{WorkspaceError, WorkspaceManager};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// The agent reported `success=false`.
    #[error("agent execution failed: {0}")]
    ExecutionFailed(String),

    #[error("push failed after retries: {0}")]
    PushFailed(String),

    #[error("unresolved merge conflicts in: {0}")]
    UnresolvedConflicts(String),

    #[error("agent produced no parseable review result")]
    MalformedReview,

    #[error("blocking task failed: {0}")]
    Join(String),
}

impl CoordinatorError {
    /// Whether this error came from cooperative cancellation rather
    /// than a real failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Executor(ExecutorError::Canceled))
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// What a completed coding run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Id,
    pub workspace: Workspace,
    /// SHA of the commit carrying the patch; `None` when the agent
    /// made no changes.
    pub commit_sha: Option<String>,
    /// True when a new commit reached the remote branch.
    pub pushed_commit: bool,
    pub session_id: Option<String>,
    pub files_changed: Vec<String>,
}

pub struct Coordinator {
    storage: Arc<Storage>,
    workspaces: Arc<WorkspaceManager>,
    executor: Arc<dyn AgentExecutor>,
    default_branch: String,
}

impl Coordinator {
    pub fn new(
        storage: Arc<Storage>,
        workspaces: Arc<WorkspaceManager>,
        executor: Arc<dyn AgentExecutor>,
        default_branch: String,
    ) -> Self {
        Self {
            storage,
            workspaces,
            executor,
            default_branch,
        }
    }

    /// Execute a coding-type run: acquire a workspace, invoke the
    /// agent, then commit and push whatever it changed.
    pub async fn execute_run(
        &self,
        payload: &RunPayload,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let prior = self.storage.latest_run_for_task(&payload.task_id).await?;
        let resume_session = payload
            .resume_session_id
            .clone()
            .or_else(|| prior.as_ref().and_then(|r| r.session_id.clone()));

        let run = self.new_run(&payload.task_id);
        self.storage.insert_run(&run).await?;

        let ws = match self.acquire_workspace(prior.as_ref(), &payload.task_id).await {
            Ok(ws) => ws,
            Err(e) => {
                self.storage
                    .update_run_status(&run.id, RunStatus::Failed, Some(&e.to_string()))
                    .await?;
                return Err(e);
            }
        };
        self.storage.set_run_workspace(&run.id, &ws).await?;
        self.storage
            .update_run_status(&run.id, RunStatus::Running, None)
            .await?;

        let request = ExecutionRequest {
            workspace_path: PathBuf::from(&ws.path),
            instruction: payload.instruction.clone(),
            constraints: payload.constraints.clone(),
            resume_session_id: resume_session,
        };

        let result = match self.executor.execute(request, cancel.clone()).await {
            Ok(result) => result,
            Err(e) => {
                let status = match &e {
                    ExecutorError::Canceled => RunStatus::Canceled,
                    _ => RunStatus::Failed,
                };
                self.storage
                    .update_run_status(&run.id, status, Some(&e.to_string()))
                    .await?;
                return Err(e.into());
            }
        };

        if !result.success {
            let msg = result
                .error
                .unwrap_or_else(|| "agent reported failure without detail".to_string());
            self.storage
                .update_run_status(&run.id, RunStatus::Failed, Some(&msg))
                .await?;
            return Err(CoordinatorError::ExecutionFailed(msg));
        }

        match self
            .publish_changes(&run.id, &ws, payload, result.session_id.clone(), cancel)
            .await
        {
            Ok(outcome) => {
                self.storage
                    .update_run_status(&run.id, RunStatus::Succeeded, None)
                    .await?;
                Ok(outcome)
            }
            Err(e) => {
                self.storage
                    .update_run_status(&run.id, RunStatus::Failed, Some(&e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    /// Execute a review-type run: invoke the agent against the task's
    /// workspace in read-only mode and parse its scored verdict from
    /// the trailing JSON line of its output.
    pub async fn execute_review(
        &self,
        payload: &ReviewPayload,
        cancel: CancellationToken,
    ) -> Result<ReviewResult> {
        let prior = self.storage.latest_run_for_task(&payload.task_id).await?;
        let ws = self.acquire_workspace(prior.as_ref(), &payload.task_id).await?;

        let instruction = format!(
            "Review pull request #{} for this repository. Assess correctness, test \
             coverage, and code quality of the changes on the current branch. \
             Finish with a single JSON line: {{\"score\": <0.0-1.0>, \"summary\": \"...\"}}",
            payload.pr_number
        );
        let request = ExecutionRequest {
            workspace_path: PathBuf::from(&ws.path),
            instruction,
            constraints: vec!["Do not modify any files in the repository.".to_string()],
            resume_session_id: None,
        };

        let result = self.executor.execute(request, cancel).await?;
        if !result.success {
            let msg = result
                .error
                .unwrap_or_else(|| "agent reported failure without detail".to_string());
            return Err(CoordinatorError::ExecutionFailed(msg));
        }

        let logs = result.logs.unwrap_or_default();
        parse_review_result(&logs).ok_or(CoordinatorError::MalformedReview)
    }

    fn new_run(&self, task_id: &str) -> Run {
        let now = chrono::Utc::now();
        Run {
            id: Id::new(),
            task_id: task_id.to_string(),
            executor_kind: self.executor.kind().to_string(),
            workspace: None,
            base_ref: self.default_branch.clone(),
            status: RunStatus::Pending,
            patch: None,
            files_changed: Vec::new(),
            session_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    async fn acquire_workspace(
        &self,
        prior: Option<&Run>,
        task_id: &str,
    ) -> Result<Workspace> {
        let existing = prior.and_then(|r| r.workspace.clone());
        let task = task_id.to_string();
        let base = self.default_branch.clone();
        let default = self.default_branch.clone();
        let ws = self
            .blocking(move |m| m.reuse_or_create(existing.as_ref(), &task, &base, &default))
            .await??;
        Ok(ws)
    }

    /// Stage, commit, and push whatever the agent changed. A run with
    /// no changes is still a successful run; it just pushes nothing.
    async fn publish_changes(
        &self,
        run_id: &Id,
        ws: &Workspace,
        payload: &RunPayload,
        session_id: Option<String>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let w = ws.clone();
        self.blocking(move |m| m.stage_all(&w)).await??;

        let w = ws.clone();
        let patch = self.blocking(move |m| m.get_diff(&w, true)).await??;
        let w = ws.clone();
        let files = self.blocking(move |m| m.staged_files(&w)).await??;

        if patch.trim().is_empty() {
            info!(run_id = %run_id, task_id = %payload.task_id, "run made no changes");
            self.storage
                .record_run_result(run_id, None, &[], session_id.as_deref())
                .await?;
            return Ok(RunOutcome {
                run_id: run_id.clone(),
                workspace: ws.clone(),
                commit_sha: None,
                pushed_commit: false,
                session_id,
                files_changed: Vec::new(),
            });
        }

        let title = payload
            .instruction
            .lines()
            .next()
            .unwrap_or("agent changes")
            .chars()
            .take(72)
            .collect::<String>();
        let w = ws.clone();
        let sha = self.blocking(move |m| m.commit(&w, &title)).await??;

        self.storage
            .record_run_result(run_id, Some(&patch), &files, session_id.as_deref())
            .await?;

        info!(
            run_id = %run_id,
            task_id = %payload.task_id,
            sha,
            files = files.len(),
            "committed agent changes"
        );

        let branch = ws.branch_name.clone();
        let w = ws.clone();
        let pushed = self.blocking(move |m| m.push(&w, &branch)).await?;
        if !pushed.success {
            if pushed.required_pull {
                self.resolve_push_conflicts(ws, session_id.as_deref(), cancel)
                    .await?;
            } else {
                return Err(CoordinatorError::PushFailed(
                    pushed.error.unwrap_or_else(|| "unknown push error".to_string()),
                ));
            }
        }

        Ok(RunOutcome {
            run_id: run_id.clone(),
            workspace: ws.clone(),
            commit_sha: Some(sha),
            pushed_commit: true,
            session_id,
            files_changed: files,
        })
    }

    /// The branch on the remote moved under us and the merge conflicts.
    /// Re-create the conflicted merge, hand the conflicting paths to
    /// the agent for exactly one resolution attempt, verify no markers
    /// remain, then commit the merge and push again.
    async fn resolve_push_conflicts(
        &self,
        ws: &Workspace,
        resume_session: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let branch = ws.branch_name.clone();
        let w = ws.clone();
        let sync = self.blocking(move |m| m.sync_with_remote(&w, &branch)).await?;

        if !sync.has_conflicts {
            // The conflicting push was undone or the merge now applies
            // cleanly; just push the merged state.
            if !sync.success {
                return Err(CoordinatorError::PushFailed(
                    sync.error.unwrap_or_else(|| "sync failed".to_string()),
                ));
            }
            return self.push_or_fail(ws).await;
        }

        let conflict_files = sync.conflict_files;
        warn!(
            branch = %ws.branch_name,
            files = ?conflict_files,
            "merge conflicts with remote branch, invoking agent to resolve"
        );

        let instruction = format!(
            "A git merge is in progress in this repository and the following files \
             contain conflict markers (<<<<<<<, =======, >>>>>>>):\n{}\n\
             Edit each file to resolve the conflicts, keeping the intent of both \
             sides. Remove every conflict marker. Do not commit; leave the files \
             resolved in the working tree.",
            conflict_files
                .iter()
                .map(|f| format!("- {f}"))
                .collect::<Vec<_>>()
                .join("\n")
        );
        let request = ExecutionRequest {
            workspace_path: PathBuf::from(&ws.path),
            instruction,
            constraints: Vec::new(),
            resume_session_id: resume_session.map(str::to_string),
        };

        let result = match self.executor.execute(request, cancel).await {
            Ok(result) => result,
            Err(e) => {
                self.abort_sync_quietly(ws).await;
                return Err(e.into());
            }
        };
        if !result.success {
            self.abort_sync_quietly(ws).await;
            return Err(CoordinatorError::ExecutionFailed(
                result
                    .error
                    .unwrap_or_else(|| "conflict resolution failed".to_string()),
            ));
        }

        let files = conflict_files.clone();
        let w = ws.clone();
        let committed = self
            .blocking(move |m| m.commit_conflict_resolution(&w, &files))
            .await?;
        match committed {
            Ok(sha) => {
                info!(branch = %ws.branch_name, sha, "conflict resolution committed");
            }
            Err(WorkspaceError::UnresolvedConflicts(remaining)) => {
                self.abort_sync_quietly(ws).await;
                return Err(CoordinatorError::UnresolvedConflicts(remaining));
            }
            Err(e) => {
                self.abort_sync_quietly(ws).await;
                return Err(e.into());
            }
        }

        self.push_or_fail(ws).await
    }

    async fn push_or_fail(&self, ws: &Workspace) -> Result<()> {
        let branch = ws.branch_name.clone();
        let w = ws.clone();
        let pushed = self.blocking(move |m| m.push(&w, &branch)).await?;
        if pushed.success {
            Ok(())
        } else {
            Err(CoordinatorError::PushFailed(
                pushed.error.unwrap_or_else(|| "unknown push error".to_string()),
            ))
        }
    }

    async fn abort_sync_quietly(&self, ws: &Workspace) {
        let w = ws.clone();
        let result = self.blocking(move |m| m.abort_sync(&w)).await;
        if let Ok(Err(e)) = result {
            warn!(path = %ws.path, error = %e, "failed to abort in-progress merge");
        }
    }

    /// Run a synchronous workspace operation off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&WorkspaceManager) -> T + Send + 'static,
        T: Send + 'static,
    {
        let manager = Arc::clone(&self.workspaces);
        tokio::task::spawn_blocking(move || f(&manager))
            .await
            .map_err(|e| CoordinatorError::Join(e.to_string()))
    }
}

/// Find the review verdict in the agent's output: the last line that
/// parses as a `{score, summary}` JSON object.
fn parse_review_result(logs: &str) -> Option<ReviewResult> {
    logs.lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<ReviewResult>(line).ok())
}
