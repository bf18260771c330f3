//! Workspace lifecycle management.
//!
//! A workspace is an isolated git working directory plus branch,
//! exclusively owned by one run. Two interchangeable creation
//! strategies exist: a shallow clone per run (strong isolation) and a
//! linked worktree off a shared repository (cheap, but a branch can
//! only be checked out in one worktree at a time).
//!
//! Sync and push report remote conflicts as data so the coordinator can
//! route them into conflict resolution instead of failing the run.

use chrono::Utc;
use pilot_core::{Workspace, WorkspaceKind};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::git;

/// Depth used for per-run shallow clones.
pub(crate) const CLONE_DEPTH: u32 = 50;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("branch already checked out in another worktree: {0}")]
    BranchInUse(String),
    #[error("unresolved merge conflicts in: {0}")]
    UnresolvedConflicts(String),
    #[error("invalid workspace: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// Outcome of syncing a workspace branch with its remote counterpart.
/// Conflicts are reported here, never raised.
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub success: bool,
    pub has_conflicts: bool,
    pub conflict_files: Vec<String>,
    pub error: Option<String>,
}

/// Outcome of a push attempt after bounded retries.
#[derive(Debug, Clone, Default)]
pub struct PushResult {
    pub success: bool,
    /// The remote moved underneath us and a sync was (or still is) needed.
    pub required_pull: bool,
    pub error: Option<String>,
}

/// Strategy for materializing an isolated workspace.
pub trait WorkspaceStrategy: Send + Sync {
    /// Create a workspace at `dest` with `branch` checked out off
    /// `base_branch`.
    fn create(&self, dest: &Path, branch: &str, base_branch: &str) -> Result<()>;

    /// Tear down whatever the strategy materialized at `path`. Must be
    /// idempotent and safe on partially-created state.
    fn destroy(&self, path: &Path, branch: &str, delete_branch: bool) -> Result<()>;

    fn kind(&self) -> WorkspaceKind;
}

/// Per-run shallow clone. Each workspace is a fully independent
/// repository, safe for true parallelism.
pub struct CloneStrategy {
    clone_url: String,
}

impl CloneStrategy {
    pub fn new(clone_url: String) -> Self {
        Self { clone_url }
    }
}

impl WorkspaceStrategy for CloneStrategy {
    fn create(&self, dest: &Path, branch: &str, base_branch: &str) -> Result<()> {
        git::shallow_clone(&self.clone_url, dest, base_branch, CLONE_DEPTH)?;
        git::checkout_new_branch(dest, branch)?;
        Ok(())
    }

    fn destroy(&self, path: &Path, _branch: &str, _delete_branch: bool) -> Result<()> {
        // The branch lives only inside the clone, so removing the
        // directory removes everything.
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    fn kind(&self) -> WorkspaceKind {
        WorkspaceKind::Clone
    }
}

/// Linked worktree off a shared base repository.
pub struct WorktreeStrategy {
    repo_root: PathBuf,
}

impl WorktreeStrategy {
    pub fn new(repo_root: PathBuf) -> Self {
        Self { repo_root }
    }
}

impl WorkspaceStrategy for WorktreeStrategy {
    fn create(&self, dest: &Path, branch: &str, base_branch: &str) -> Result<()> {
        match git::add_worktree(&self.repo_root, dest, branch, base_branch) {
            Ok(()) => Ok(()),
            Err(git::GitError::CommandFailed(msg)) if is_branch_in_use(&msg) => {
                // Usually a stale registration for a worktree directory
                // that was deleted out from under git. Prune and retry
                // once; a live collision stays a non-fatal error.
                git::prune_worktrees(&self.repo_root)?;
                match git::add_worktree(&self.repo_root, dest, branch, base_branch) {
                    Ok(()) => Ok(()),
                    Err(git::GitError::CommandFailed(msg)) if is_branch_in_use(&msg) => {
                        Err(WorkspaceError::BranchInUse(branch.to_string()))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn destroy(&self, path: &Path, branch: &str, delete_branch: bool) -> Result<()> {
        if path.exists() {
            git::remove_worktree(&self.repo_root, path)?;
        }
        if delete_branch && git::branch_exists(&self.repo_root, branch)? {
            git::delete_branch(&self.repo_root, branch)?;
        }
        Ok(())
    }

    fn kind(&self) -> WorkspaceKind {
        WorkspaceKind::Worktree
    }
}

/// Workspace adapter used by the run coordinator.
///
/// All operations are synchronous; async callers wrap them in a
/// blocking task.
pub struct WorkspaceManager {
    root: PathBuf,
    branch_prefix: String,
    push_retries: u32,
    strategy: Box<dyn WorkspaceStrategy>,
}

impl WorkspaceManager {
    pub fn new(
        root: PathBuf,
        branch_prefix: String,
        push_retries: u32,
        strategy: Box<dyn WorkspaceStrategy>,
    ) -> Self {
        Self {
            root,
            branch_prefix,
            push_retries,
            strategy,
        }
    }

    /// Branch name for a task's workspace.
    pub fn branch_name(&self, task_id: &str) -> String {
        format!("{}{}", self.branch_prefix, slugify(task_id))
    }

    /// Workspace directory for a task.
    pub fn workspace_path(&self, task_id: &str) -> PathBuf {
        self.root.join(slugify(task_id))
    }

    /// A workspace path is valid when it exists, is a git repository,
    /// and has the expected branch checked out.
    pub fn is_valid(&self, path: &Path, branch: &str) -> bool {
        if !git::is_git_repo(path) {
            return false;
        }
        match git::current_branch(path) {
            Ok(current) => current == branch,
            Err(_) => false,
        }
    }

    /// Create a fresh workspace for a task.
    pub fn create(&self, task_id: &str, base_branch: &str) -> Result<Workspace> {
        let branch = self.branch_name(task_id);
        let path = self.workspace_path(task_id);

        // A leftover directory from an earlier failed create would make
        // clone/worktree creation fail; clear it first.
        if path.exists() && !self.is_valid(&path, &branch) {
            std::fs::remove_dir_all(&path)?;
        }

        self.strategy.create(&path, &branch, base_branch)?;
        debug!(task_id, branch, path = %path.display(), "created workspace");

        Ok(Workspace {
            path: path.to_string_lossy().to_string(),
            branch_name: branch,
            base_branch: base_branch.to_string(),
            kind: self.strategy.kind(),
            created_at: Utc::now(),
        })
    }

    /// Reuse a prior run's workspace when still sound, otherwise discard
    /// it and create a fresh one.
    ///
    /// A workspace tracking the default branch is only reused when its
    /// HEAD still descends from the latest remote default branch tip;
    /// anything else has gone stale underneath us.
    pub fn reuse_or_create(
        &self,
        existing: Option<&Workspace>,
        task_id: &str,
        base_branch: &str,
        default_branch: &str,
    ) -> Result<Workspace> {
        if let Some(ws) = existing {
            let path = Path::new(&ws.path);
            if self.is_valid(path, &ws.branch_name) {
                if ws.base_branch != default_branch || self.descends_from_remote(path, default_branch)? {
                    debug!(task_id, path = %ws.path, "reusing workspace");
                    return Ok(ws.clone());
                }
                debug!(task_id, path = %ws.path, "workspace behind remote default, recreating");
            }
            // Stale or invalid. Tear it down before recreating.
            if let Err(e) = self.cleanup(ws, true) {
                warn!(task_id, error = %e, "failed to clean up stale workspace");
            }
        }
        self.create(task_id, base_branch)
    }

    fn descends_from_remote(&self, path: &Path, default_branch: &str) -> Result<bool> {
        if let Err(e) = git::fetch(path, "origin", default_branch) {
            // Unreachable remote is transient; keep the workspace.
            warn!(error = %e, "fetch of default branch failed, assuming workspace current");
            return Ok(true);
        }
        let head = git::head_sha(path)?;
        Ok(git::is_ancestor(path, &format!("origin/{default_branch}"), &head)?)
    }

    /// Stage every change in the workspace.
    pub fn stage_all(&self, ws: &Workspace) -> Result<()> {
        git::stage_all(Path::new(&ws.path))?;
        Ok(())
    }

    /// Diff of the working tree, or of the index when `staged`.
    pub fn get_diff(&self, ws: &Workspace, staged: bool) -> Result<String> {
        Ok(git::diff(Path::new(&ws.path), staged)?)
    }

    /// Paths currently staged in the workspace.
    pub fn staged_files(&self, ws: &Workspace) -> Result<Vec<String>> {
        Ok(git::staged_files(Path::new(&ws.path))?)
    }

    /// Commit staged changes, returning the commit SHA.
    pub fn commit(&self, ws: &Workspace, message: &str) -> Result<String> {
        Ok(git::commit(Path::new(&ws.path), message)?)
    }

    /// Whether the remote copy of `branch` has commits we lack.
    pub fn is_behind_remote(&self, ws: &Workspace, branch: &str) -> Result<bool> {
        let path = Path::new(&ws.path);
        if !git::remote_branch_exists(path, "origin", branch)? {
            return Ok(false);
        }
        git::fetch(path, "origin", branch)?;
        Ok(git::commits_behind(path, "HEAD", &format!("origin/{branch}"))? > 0)
    }

    /// Fetch and merge the remote copy of `branch` into the workspace.
    ///
    /// On conflict the merge is left in progress with markers in the
    /// listed files so a resolver can edit them; the caller either
    /// finishes via [`commit_conflict_resolution`] or aborts.
    pub fn sync_with_remote(&self, ws: &Workspace, branch: &str) -> SyncResult {
        let path = Path::new(&ws.path);

        match git::remote_branch_exists(path, "origin", branch) {
            Ok(false) => {
                // Nothing upstream to sync against.
                return SyncResult {
                    success: true,
                    ..Default::default()
                };
            }
            Ok(true) => {}
            Err(e) => {
                return SyncResult {
                    error: Some(e.to_string()),
                    ..Default::default()
                };
            }
        }

        if let Err(e) = git::fetch(path, "origin", branch) {
            return SyncResult {
                error: Some(e.to_string()),
                ..Default::default()
            };
        }

        match git::merge(path, &format!("origin/{branch}")) {
            Ok(outcome) if outcome.success => SyncResult {
                success: true,
                ..Default::default()
            },
            Ok(outcome) => SyncResult {
                has_conflicts: true,
                conflict_files: outcome.conflict_files,
                ..Default::default()
            },
            Err(e) => SyncResult {
                error: Some(e.to_string()),
                ..Default::default()
            },
        }
    }

    /// Abort an in-progress conflicted merge, restoring the tree.
    pub fn abort_sync(&self, ws: &Workspace) -> Result<()> {
        git::abort_merge(Path::new(&ws.path))?;
        Ok(())
    }

    /// Finish a conflicted merge after the files have been edited.
    ///
    /// Re-scans for residual conflict markers first; an unresolved file
    /// fails the resolution rather than committing a broken merge.
    pub fn commit_conflict_resolution(
        &self,
        ws: &Workspace,
        conflict_files: &[String],
    ) -> Result<String> {
        let path = Path::new(&ws.path);
        let remaining = git::files_with_conflict_markers(path, conflict_files)?;
        if !remaining.is_empty() {
            return Err(WorkspaceError::UnresolvedConflicts(remaining.join(", ")));
        }
        git::stage_all(path)?;
        let sha = git::commit(path, "Merge remote changes")?;
        Ok(sha)
    }

    /// Push the workspace branch, retrying across non-fast-forward
    /// races with any concurrent push to the same branch.
    pub fn push(&self, ws: &Workspace, branch: &str) -> PushResult {
        let path = Path::new(&ws.path);
        let mut required_pull = false;
        let mut last_error = None;

        for attempt in 0..self.push_retries {
            match git::push(path, "origin", branch) {
                Ok(git::PushOutcome::Pushed) => {
                    return PushResult {
                        success: true,
                        required_pull,
                        error: None,
                    };
                }
                Ok(git::PushOutcome::Rejected(msg)) => {
                    debug!(branch, attempt, "push rejected, syncing with remote");
                    required_pull = true;
                    last_error = Some(msg);
                    let sync = self.sync_with_remote(ws, branch);
                    if sync.has_conflicts {
                        // Leave conflict handling to the caller.
                        let _ = self.abort_sync(ws);
                        return PushResult {
                            success: false,
                            required_pull: true,
                            error: Some(format!(
                                "push conflicts with remote changes in: {}",
                                sync.conflict_files.join(", ")
                            )),
                        };
                    }
                    if let Some(e) = sync.error {
                        last_error = Some(e);
                    }
                }
                Err(e) => {
                    return PushResult {
                        success: false,
                        required_pull,
                        error: Some(e.to_string()),
                    };
                }
            }
        }

        PushResult {
            success: false,
            required_pull,
            error: last_error
                .or_else(|| Some("push retries exhausted".to_string())),
        }
    }

    /// Remove a workspace (and optionally its branch). Idempotent, safe
    /// on partially-created or already-removed paths.
    pub fn cleanup(&self, ws: &Workspace, delete_branch: bool) -> Result<()> {
        let path = Path::new(&ws.path);
        match self.strategy.destroy(path, &ws.branch_name, delete_branch) {
            Ok(()) => Ok(()),
            Err(e) if !path.exists() => {
                // Already gone; a second cleanup is not an error.
                debug!(path = %ws.path, error = %e, "cleanup of missing workspace");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn is_branch_in_use(msg: &str) -> bool {
    msg.contains("already checked out") || msg.contains("already used by worktree")
}

/// Filesystem- and branch-safe slug (lowercase alphanumeric + hyphens).
fn slugify(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
