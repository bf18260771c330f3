//! Low-level git primitives for workspace management.
//!
//! Thin synchronous wrappers over the `git` binary. Higher-level policy
//! (workspace strategies, reuse, conflict resolution) lives in the
//! workspace module; everything here is a single git invocation with
//! its output parsed into data. Merge conflicts are reported as values,
//! not errors, so callers can route them into the fix loop.

use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("not a git repository: {0}")]
    NotARepo(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
    #[error("nothing to commit in {0}")]
    NothingToCommit(String),
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Run git with the given args, returning trimmed stdout on success.
fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git").args(args).current_dir(dir).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    let stdout = String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)?;
    Ok(stdout.trim().to_string())
}

/// Run git, returning (success, stdout, stderr) without treating a
/// nonzero exit as an error. Used where failure is an expected outcome.
fn try_git(dir: &Path, args: &[&str]) -> Result<(bool, String, String)> {
    let output = Command::new("git").args(args).current_dir(dir).output()?;
    Ok((
        output.status.success(),
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
    ))
}

/// Check whether a path is the root of a git working tree or worktree.
pub fn is_git_repo(path: &Path) -> bool {
    if !path.is_dir() {
        return false;
    }
    try_git(path, &["rev-parse", "--is-inside-work-tree"])
        .map(|(ok, stdout, _)| ok && stdout.trim() == "true")
        .unwrap_or(false)
}

/// The currently checked-out branch name.
pub fn current_branch(dir: &Path) -> Result<String> {
    let branch = run_git(dir, &["branch", "--show-current"])?;
    if branch.is_empty() {
        return Err(GitError::CommandFailed(
            "detached HEAD, no current branch".to_string(),
        ));
    }
    Ok(branch)
}

/// Detect the default branch for a repository.
///
/// Tries `git symbolic-ref refs/remotes/origin/HEAD` first, then falls
/// back through `main` and `master`.
pub fn detect_default_branch(dir: &Path) -> Result<String> {
    let (ok, stdout, _) = try_git(dir, &["symbolic-ref", "refs/remotes/origin/HEAD"])?;
    if ok {
        if let Some(branch) = stdout.trim().strip_prefix("refs/remotes/origin/") {
            return Ok(branch.to_string());
        }
    }

    for candidate in ["main", "master"] {
        let (ok, _, _) = try_git(
            dir,
            &["rev-parse", "--verify", &format!("refs/heads/{candidate}")],
        )?;
        if ok {
            return Ok(candidate.to_string());
        }
    }

    Ok("main".to_string())
}

/// Check if a branch exists locally.
pub fn branch_exists(dir: &Path, branch: &str) -> Result<bool> {
    let (ok, _, _) = try_git(
        dir,
        &["rev-parse", "--verify", &format!("refs/heads/{branch}")],
    )?;
    Ok(ok)
}

/// Check if a branch exists on the named remote.
pub fn remote_branch_exists(dir: &Path, remote: &str, branch: &str) -> Result<bool> {
    let out = run_git(dir, &["ls-remote", "--heads", remote, branch])?;
    Ok(!out.is_empty())
}

/// Shallow-clone a repository and check out a new branch off `base_branch`.
pub fn shallow_clone(url: &str, dest: &Path, base_branch: &str, depth: u32) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let dest_str = dest.to_string_lossy();
    let depth_str = depth.to_string();
    // Run from the parent so a relative dest still lands in the right place.
    let cwd = dest.parent().unwrap_or_else(|| Path::new("."));
    run_git(
        cwd,
        &[
            "clone",
            "--depth",
            &depth_str,
            "--branch",
            base_branch,
            "--single-branch",
            url,
            dest_str.as_ref(),
        ],
    )?;
    Ok(())
}

/// Create and check out a new branch at the current HEAD.
pub fn checkout_new_branch(dir: &Path, branch: &str) -> Result<()> {
    run_git(dir, &["checkout", "-b", branch])?;
    Ok(())
}

/// Check out an existing branch.
pub fn checkout_branch(dir: &Path, branch: &str) -> Result<()> {
    run_git(dir, &["checkout", branch])?;
    Ok(())
}

/// Add a linked worktree at `dest` on a new branch off `base_branch`.
///
/// Fails with the git error text if the branch is already checked out in
/// another worktree; callers decide whether that is fatal.
pub fn add_worktree(repo: &Path, dest: &Path, branch: &str, base_branch: &str) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let dest_str = dest.to_string_lossy();
    if branch_exists(repo, branch)? {
        run_git(repo, &["worktree", "add", dest_str.as_ref(), branch])?;
    } else {
        run_git(
            repo,
            &["worktree", "add", "-b", branch, dest_str.as_ref(), base_branch],
        )?;
    }
    Ok(())
}

/// Drop stale worktree registrations whose directories no longer exist.
pub fn prune_worktrees(repo: &Path) -> Result<()> {
    run_git(repo, &["worktree", "prune"])?;
    Ok(())
}

/// Remove a linked worktree, discarding local changes.
pub fn remove_worktree(repo: &Path, worktree_path: &Path) -> Result<()> {
    let path_str = worktree_path.to_string_lossy();
    run_git(repo, &["worktree", "remove", "--force", path_str.as_ref()])?;
    Ok(())
}

/// Delete a local branch.
pub fn delete_branch(dir: &Path, branch: &str) -> Result<()> {
    run_git(dir, &["branch", "-D", branch])?;
    Ok(())
}

/// Stage every change in the working tree, including untracked files.
pub fn stage_all(dir: &Path) -> Result<()> {
    run_git(dir, &["add", "-A"])?;
    Ok(())
}

/// The unified diff of the working tree (or the index when `staged`).
pub fn diff(dir: &Path, staged: bool) -> Result<String> {
    let (ok, stdout, stderr) = if staged {
        try_git(dir, &["diff", "--cached"])?
    } else {
        try_git(dir, &["diff"])?
    };
    if !ok {
        return Err(GitError::CommandFailed(format!("git diff: {stderr}")));
    }
    Ok(stdout)
}

/// Paths touched in the index, one per line.
pub fn staged_files(dir: &Path) -> Result<Vec<String>> {
    let out = run_git(dir, &["diff", "--cached", "--name-only"])?;
    Ok(out.lines().map(str::to_string).collect())
}

/// Whether the working tree has no uncommitted or untracked changes.
pub fn is_working_tree_clean(dir: &Path) -> Result<bool> {
    let out = run_git(dir, &["status", "--porcelain"])?;
    Ok(out.is_empty())
}

/// Commit staged changes and return the new commit SHA.
pub fn commit(dir: &Path, message: &str) -> Result<String> {
    let (staged_ok, _, _) = try_git(dir, &["diff", "--cached", "--quiet"])?;
    if staged_ok {
        return Err(GitError::NothingToCommit(dir.display().to_string()));
    }
    run_git(dir, &["commit", "-m", message])?;
    head_sha(dir)
}

/// The SHA of the current HEAD.
pub fn head_sha(dir: &Path) -> Result<String> {
    run_git(dir, &["rev-parse", "HEAD"])
}

/// Fetch a branch from the named remote into its remote-tracking ref.
///
/// The explicit refspec matters: single-branch clones only map their
/// original branch, so a bare `git fetch origin <branch>` would update
/// FETCH_HEAD without creating `refs/remotes/<remote>/<branch>`.
pub fn fetch(dir: &Path, remote: &str, branch: &str) -> Result<()> {
    let refspec = format!("+refs/heads/{branch}:refs/remotes/{remote}/{branch}");
    run_git(dir, &["fetch", remote, &refspec])?;
    Ok(())
}

/// Whether `ancestor` is an ancestor of `descendant`.
pub fn is_ancestor(dir: &Path, ancestor: &str, descendant: &str) -> Result<bool> {
    let (ok, _, _) = try_git(dir, &["merge-base", "--is-ancestor", ancestor, descendant])?;
    Ok(ok)
}

/// How many commits `upstream` has that `branch` lacks. Requires a
/// prior fetch for the count to reflect the remote.
pub fn commits_behind(dir: &Path, branch: &str, upstream: &str) -> Result<u64> {
    let out = run_git(dir, &["rev-list", "--count", &format!("{branch}..{upstream}")])?;
    out.parse()
        .map_err(|_| GitError::CommandFailed(format!("unparseable rev-list count: {out}")))
}

/// Outcome of a merge attempt. Conflicts are data, not errors.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub success: bool,
    pub conflict_files: Vec<String>,
}

/// Merge `source` into the current branch.
///
/// On conflict the merge is left in progress so a resolver can edit the
/// conflicted files; call [`abort_merge`] to back out instead.
pub fn merge(dir: &Path, source: &str) -> Result<MergeOutcome> {
    let (ok, _, stderr) = try_git(dir, &["merge", source, "--no-edit"])?;
    if ok {
        return Ok(MergeOutcome {
            success: true,
            conflict_files: Vec::new(),
        });
    }

    let conflicts = conflicted_files(dir)?;
    if conflicts.is_empty() {
        return Err(GitError::CommandFailed(format!(
            "git merge {source}: {}",
            stderr.trim()
        )));
    }
    Ok(MergeOutcome {
        success: false,
        conflict_files: conflicts,
    })
}

/// Abort an in-progress merge, restoring the pre-merge tree.
pub fn abort_merge(dir: &Path) -> Result<()> {
    run_git(dir, &["merge", "--abort"])?;
    Ok(())
}

/// Paths still in the unmerged index state.
pub fn conflicted_files(dir: &Path) -> Result<Vec<String>> {
    let out = run_git(dir, &["diff", "--name-only", "--diff-filter=U"])?;
    Ok(out.lines().map(str::to_string).collect())
}

/// Scan files for leftover conflict markers. Returns the paths that
/// still contain one.
pub fn files_with_conflict_markers(dir: &Path, files: &[String]) -> Result<Vec<String>> {
    let mut remaining = Vec::new();
    for file in files {
        let path = dir.join(file);
        if !path.exists() {
            continue;
        }
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        if content
            .lines()
            .any(|l| l.starts_with("<<<<<<<") || l.starts_with(">>>>>>>"))
        {
            remaining.push(file.clone());
        }
    }
    Ok(remaining)
}

/// Outcome of a push attempt.
#[derive(Debug, Clone)]
pub enum PushOutcome {
    Pushed,
    /// The remote rejected a non-fast-forward update; the caller should
    /// sync with the remote and retry.
    Rejected(String),
}

/// Push a branch to the named remote, setting upstream.
pub fn push(dir: &Path, remote: &str, branch: &str) -> Result<PushOutcome> {
    let (ok, _, stderr) = try_git(dir, &["push", "--set-upstream", remote, branch])?;
    if ok {
        return Ok(PushOutcome::Pushed);
    }
    if stderr.contains("non-fast-forward")
        || stderr.contains("[rejected]")
        || stderr.contains("fetch first")
    {
        return Ok(PushOutcome::Rejected(stderr.trim().to_string()));
    }
    Err(GitError::CommandFailed(format!(
        "git push {remote} {branch}: {}",
        stderr.trim()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn git_in(dir: &Path, args: &[&str]) {
        let out = Command::new("git").args(args).current_dir(dir).output().unwrap();
        assert!(
            out.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
    }

    /// Create a test git repository with one commit on `main`.
    fn setup_test_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        git_in(dir.path(), &["init", "-b", "main"]);
        git_in(dir.path(), &["config", "user.email", "test@test.com"]);
        git_in(dir.path(), &["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "# Test\n").unwrap();
        git_in(dir.path(), &["add", "."]);
        git_in(dir.path(), &["commit", "-m", "Initial commit"]);
        dir
    }

    /// A bare remote plus a working clone of it.
    fn setup_repo_with_remote() -> (TempDir, TempDir) {
        let remote = TempDir::new().unwrap();
        git_in(remote.path(), &["init", "--bare", "-b", "main"]);

        let seed = setup_test_repo();
        git_in(
            seed.path(),
            &["remote", "add", "origin", &remote.path().to_string_lossy()],
        );
        git_in(seed.path(), &["push", "origin", "main"]);
        (remote, seed)
    }

    fn commit_file(dir: &Path, name: &str, content: &str, message: &str) {
        std::fs::write(dir.join(name), content).unwrap();
        git_in(dir, &["add", name]);
        git_in(dir, &["commit", "-m", message]);
    }

    #[test]
    fn detects_repo_and_branch() {
        let dir = setup_test_repo();
        assert!(is_git_repo(dir.path()));
        assert_eq!(current_branch(dir.path()).unwrap(), "main");
        assert_eq!(detect_default_branch(dir.path()).unwrap(), "main");

        let empty = TempDir::new().unwrap();
        assert!(!is_git_repo(empty.path()));
        assert!(!is_git_repo(Path::new("/nonexistent/nowhere")));
    }

    #[test]
    fn checkout_new_branch_switches() {
        let dir = setup_test_repo();
        checkout_new_branch(dir.path(), "pilot/task-1").unwrap();
        assert_eq!(current_branch(dir.path()).unwrap(), "pilot/task-1");
        assert!(branch_exists(dir.path(), "pilot/task-1").unwrap());
        assert!(!branch_exists(dir.path(), "pilot/task-2").unwrap());
    }

    #[test]
    fn stage_diff_commit_round_trip() {
        let dir = setup_test_repo();
        std::fs::write(dir.path().join("new.txt"), "hello\n").unwrap();

        assert!(!is_working_tree_clean(dir.path()).unwrap());
        stage_all(dir.path()).unwrap();
        let patch = diff(dir.path(), true).unwrap();
        assert!(patch.contains("new.txt"));
        assert_eq!(staged_files(dir.path()).unwrap(), vec!["new.txt".to_string()]);

        let sha = commit(dir.path(), "add new.txt").unwrap();
        assert_eq!(sha.len(), 40);
        assert_eq!(head_sha(dir.path()).unwrap(), sha);
        assert!(is_working_tree_clean(dir.path()).unwrap());
    }

    #[test]
    fn commit_with_nothing_staged_is_an_error() {
        let dir = setup_test_repo();
        let result = commit(dir.path(), "empty");
        assert!(matches!(result, Err(GitError::NothingToCommit(_))));
    }

    #[test]
    fn merge_without_overlap_succeeds() {
        let dir = setup_test_repo();
        checkout_new_branch(dir.path(), "feature").unwrap();
        commit_file(dir.path(), "feature.txt", "feature\n", "Add feature");
        checkout_branch(dir.path(), "main").unwrap();

        let outcome = merge(dir.path(), "feature").unwrap();
        assert!(outcome.success);
        assert!(outcome.conflict_files.is_empty());
        assert!(dir.path().join("feature.txt").exists());
    }

    #[test]
    fn merge_with_divergent_edits_reports_conflict_paths() {
        let dir = setup_test_repo();
        checkout_new_branch(dir.path(), "feature").unwrap();
        commit_file(dir.path(), "shared.txt", "feature version\n", "Feature edit");
        checkout_branch(dir.path(), "main").unwrap();
        commit_file(dir.path(), "shared.txt", "main version\n", "Main edit");

        let outcome = merge(dir.path(), "feature").unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.conflict_files, vec!["shared.txt".to_string()]);

        // The conflicted file carries markers until resolved.
        let marked =
            files_with_conflict_markers(dir.path(), &outcome.conflict_files).unwrap();
        assert_eq!(marked, vec!["shared.txt".to_string()]);

        abort_merge(dir.path()).unwrap();
        assert!(is_working_tree_clean(dir.path()).unwrap());
    }

    #[test]
    fn ancestor_checks_track_history() {
        let dir = setup_test_repo();
        let base = head_sha(dir.path()).unwrap();
        commit_file(dir.path(), "next.txt", "next\n", "Next commit");
        let tip = head_sha(dir.path()).unwrap();

        assert!(is_ancestor(dir.path(), &base, &tip).unwrap());
        assert!(!is_ancestor(dir.path(), &tip, &base).unwrap());
    }

    #[test]
    fn push_and_remote_branch_visibility() {
        let (_remote, repo) = setup_repo_with_remote();
        checkout_new_branch(repo.path(), "pilot/task-1").unwrap();
        commit_file(repo.path(), "work.txt", "work\n", "Task work");

        assert!(!remote_branch_exists(repo.path(), "origin", "pilot/task-1").unwrap());
        let outcome = push(repo.path(), "origin", "pilot/task-1").unwrap();
        assert!(matches!(outcome, PushOutcome::Pushed));
        assert!(remote_branch_exists(repo.path(), "origin", "pilot/task-1").unwrap());
    }

    #[test]
    fn non_fast_forward_push_is_rejected_not_fatal() {
        let (remote, repo) = setup_repo_with_remote();

        // A second clone pushes to main first.
        let other_dir = TempDir::new().unwrap();
        let other = other_dir.path().join("clone");
        git_in(
            other_dir.path(),
            &["clone", &remote.path().to_string_lossy(), "clone"],
        );
        git_in(&other, &["config", "user.email", "test@test.com"]);
        git_in(&other, &["config", "user.name", "Test"]);
        commit_file(&other, "race.txt", "other\n", "Concurrent push");
        git_in(&other, &["push", "origin", "main"]);

        // Our stale clone now loses the race.
        commit_file(repo.path(), "ours.txt", "ours\n", "Local commit");
        let outcome = push(repo.path(), "origin", "main").unwrap();
        assert!(matches!(outcome, PushOutcome::Rejected(_)));
    }

    #[test]
    fn fetch_and_behind_count() {
        let (remote, repo) = setup_repo_with_remote();

        let other_dir = TempDir::new().unwrap();
        let other = other_dir.path().join("clone");
        git_in(
            other_dir.path(),
            &["clone", &remote.path().to_string_lossy(), "clone"],
        );
        git_in(&other, &["config", "user.email", "test@test.com"]);
        git_in(&other, &["config", "user.name", "Test"]);
        commit_file(&other, "ahead.txt", "ahead\n", "Remote moves ahead");
        git_in(&other, &["push", "origin", "main"]);

        fetch(repo.path(), "origin", "main").unwrap();
        assert_eq!(commits_behind(repo.path(), "main", "origin/main").unwrap(), 1);
    }

    #[test]
    fn worktree_add_and_remove() {
        let dir = setup_test_repo();
        let wt_dir = TempDir::new().unwrap();
        let wt_path = wt_dir.path().join("task-1");

        add_worktree(dir.path(), &wt_path, "pilot/task-1", "main").unwrap();
        assert!(is_git_repo(&wt_path));
        assert_eq!(current_branch(&wt_path).unwrap(), "pilot/task-1");

        // The same branch cannot be checked out in a second worktree.
        let second = wt_dir.path().join("task-1-dup");
        let result = add_worktree(dir.path(), &second, "pilot/task-1", "main");
        assert!(result.is_err());

        remove_worktree(dir.path(), &wt_path).unwrap();
        assert!(!wt_path.exists());
        delete_branch(dir.path(), "pilot/task-1").unwrap();
        assert!(!branch_exists(dir.path(), "pilot/task-1").unwrap());
    }
}
