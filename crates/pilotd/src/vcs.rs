//! VCS service: pull-request operations against the hosting provider.
//!
//! The daemon shells out to the `gh` CLI rather than speaking REST
//! directly; authentication and pagination stay the CLI's problem. All
//! provider output is consumed as JSON and parsed into small structs so
//! the rest of the daemon never sees provider-specific strings.

use async_trait::async_trait;
use pilot_core::{CiJobResult, MergeMethod, PrRef};
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("gh command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute gh: {0}")]
    Execution(#[from] std::io::Error),
    #[error("unparseable gh output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("pull request has no number in: {0}")]
    MalformedPrUrl(String),
}

pub type Result<T> = std::result::Result<T, VcsError>;

/// Provider view of a pull request's state.
#[derive(Debug, Clone)]
pub struct PrStatus {
    /// `OPEN`, `MERGED`, or `CLOSED`.
    pub state: String,
    /// Provider-reported mergeability; `None` while the provider is
    /// still computing it.
    pub mergeable: Option<bool>,
}

/// Combined status of all checks on a pull request head.
#[derive(Debug, Clone, Default)]
pub struct CheckStatus {
    /// At least one check has not reached a terminal state.
    pub pending: bool,
    pub jobs: Vec<CiJobResult>,
}

/// Hosting-provider collaborator.
#[async_trait]
pub trait VcsService: Send + Sync {
    /// HTTPS clone URL for a repository.
    fn clone_url(&self, owner: &str, repo: &str) -> String;

    /// Open a pull request from `head` into `base`. Returns the
    /// existing PR when one is already open for the branch.
    async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PrRef>;

    async fn get_pull_request_status(&self, pr: &PrRef) -> Result<PrStatus>;

    /// Whether the provider currently reports the PR as mergeable.
    /// `None` means the computation is still in flight.
    async fn is_pr_mergeable(&self, pr: &PrRef) -> Result<Option<bool>>;

    /// Whether the provider reports merge conflicts against the base.
    async fn check_pr_conflicts(&self, pr: &PrRef) -> Result<bool>;

    /// Current state of every check run on the PR head.
    async fn get_pr_check_status(&self, pr: &PrRef) -> Result<CheckStatus>;

    async fn merge_pr(&self, pr: &PrRef, method: MergeMethod, delete_branch: bool) -> Result<()>;

    /// Delete the PR's head branch on the remote.
    async fn delete_pr_branch(&self, pr: &PrRef) -> Result<()>;
}

/// VCS adapter backed by the GitHub CLI.
pub struct GhCliVcs;

impl GhCliVcs {
    pub fn new() -> Self {
        Self
    }

    async fn gh(&self, args: &[&str]) -> Result<String> {
        debug!(?args, "running gh");
        let output = Command::new("gh").args(args).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VcsError::CommandFailed(format!(
                "gh {}: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for GhCliVcs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VcsService for GhCliVcs {
    fn clone_url(&self, owner: &str, repo: &str) -> String {
        format!("https://github.com/{owner}/{repo}.git")
    }

    async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PrRef> {
        let slug = format!("{owner}/{repo}");
        let result = self
            .gh(&[
                "pr", "create", "--repo", &slug, "--head", head, "--base", base, "--title",
                title, "--body", body,
            ])
            .await;

        match result {
            Ok(stdout) => {
                let number = parse_pr_number_from_url(&stdout)
                    .ok_or_else(|| VcsError::MalformedPrUrl(stdout.clone()))?;
                Ok(PrRef {
                    owner: owner.to_string(),
                    repo: repo.to_string(),
                    number,
                })
            }
            Err(VcsError::CommandFailed(msg)) if msg.contains("already exists") => {
                // Reuse the PR a prior (crashed or retried) cycle opened.
                let stdout = self
                    .gh(&["pr", "view", head, "--repo", &slug, "--json", "number"])
                    .await?;
                let view: PrNumberJson = serde_json::from_str(&stdout)?;
                Ok(PrRef {
                    owner: owner.to_string(),
                    repo: repo.to_string(),
                    number: view.number,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn get_pull_request_status(&self, pr: &PrRef) -> Result<PrStatus> {
        let slug = format!("{}/{}", pr.owner, pr.repo);
        let number = pr.number.to_string();
        let stdout = self
            .gh(&[
                "pr", "view", &number, "--repo", &slug, "--json", "state,mergeable",
            ])
            .await?;
        Ok(parse_pr_status(&stdout)?)
    }

    async fn is_pr_mergeable(&self, pr: &PrRef) -> Result<Option<bool>> {
        Ok(self.get_pull_request_status(pr).await?.mergeable)
    }

    async fn check_pr_conflicts(&self, pr: &PrRef) -> Result<bool> {
        Ok(self.get_pull_request_status(pr).await?.mergeable == Some(false))
    }

    async fn get_pr_check_status(&self, pr: &PrRef) -> Result<CheckStatus> {
        let slug = format!("{}/{}", pr.owner, pr.repo);
        let number = pr.number.to_string();
        let result = self
            .gh(&[
                "pr", "checks", &number, "--repo", &slug, "--json", "name,bucket,link",
            ])
            .await;

        match result {
            Ok(stdout) => Ok(parse_check_status(&stdout)?),
            // gh exits nonzero when checks are still pending or absent.
            Err(VcsError::CommandFailed(msg)) if msg.contains("no checks reported") => {
                Ok(CheckStatus {
                    pending: true,
                    jobs: Vec::new(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn merge_pr(&self, pr: &PrRef, method: MergeMethod, delete_branch: bool) -> Result<()> {
        let slug = format!("{}/{}", pr.owner, pr.repo);
        let number = pr.number.to_string();
        let method_flag = match method {
            MergeMethod::Merge => "--merge",
            MergeMethod::Squash => "--squash",
            MergeMethod::Rebase => "--rebase",
        };
        let mut args = vec!["pr", "merge", &number, "--repo", &slug, method_flag];
        if delete_branch {
            args.push("--delete-branch");
        }
        self.gh(&args).await?;
        Ok(())
    }

    async fn delete_pr_branch(&self, pr: &PrRef) -> Result<()> {
        let slug = format!("{}/{}", pr.owner, pr.repo);
        let number = pr.number.to_string();
        let stdout = self
            .gh(&["pr", "view", &number, "--repo", &slug, "--json", "headRefName"])
            .await?;
        let head: HeadRefJson = serde_json::from_str(&stdout)?;
        self.gh(&[
            "api",
            "-X",
            "DELETE",
            &format!("repos/{slug}/git/refs/heads/{}", head.head_ref_name),
        ])
        .await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct PrNumberJson {
    number: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeadRefJson {
    head_ref_name: String,
}

#[derive(Deserialize)]
struct PrStatusJson {
    state: String,
    mergeable: Option<String>,
}

#[derive(Deserialize)]
struct CheckJson {
    name: String,
    bucket: String,
    #[serde(default)]
    link: Option<String>,
}

/// PR number from a `gh pr create` URL (last path segment).
fn parse_pr_number_from_url(url: &str) -> Option<u64> {
    url.trim().rsplit('/').next()?.parse().ok()
}

fn parse_pr_status(json: &str) -> serde_json::Result<PrStatus> {
    let raw: PrStatusJson = serde_json::from_str(json)?;
    let mergeable = match raw.mergeable.as_deref() {
        Some("MERGEABLE") => Some(true),
        Some("CONFLICTING") => Some(false),
        _ => None,
    };
    Ok(PrStatus {
        state: raw.state,
        mergeable,
    })
}

fn parse_check_status(json: &str) -> serde_json::Result<CheckStatus> {
    let raw: Vec<CheckJson> = serde_json::from_str(json)?;
    let mut pending = false;
    let mut jobs = Vec::with_capacity(raw.len());
    for check in raw {
        let result = match check.bucket.as_str() {
            "pass" => "success",
            "fail" => "failure",
            "skipping" => "skipped",
            "cancel" => "error",
            _ => {
                pending = true;
                "pending"
            }
        };
        let log_excerpt = if result == "failure" || result == "error" {
            check.link
        } else {
            None
        };
        jobs.push(CiJobResult {
            job_name: check.name,
            result: result.to_string(),
            log_excerpt,
        });
    }
    Ok(CheckStatus { pending, jobs })
}

/// Configurable in-memory VCS used by unit tests across the daemon.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    pub(crate) struct StubVcs {
        /// Scripted responses for `get_pr_check_status`; once exhausted,
        /// the last successful status repeats.
        pub check_script: Mutex<VecDeque<Result<CheckStatus>>>,
        last_check: Mutex<Option<CheckStatus>>,
        pub mergeable: Mutex<Option<bool>>,
        pub conflicts: Mutex<bool>,
        pub merged: Mutex<Vec<(u64, MergeMethod, bool)>>,
        pub merge_error: Mutex<Option<String>>,
        pub deleted_branches: Mutex<Vec<u64>>,
        pub delete_error: Mutex<Option<String>>,
        pub created_prs: Mutex<Vec<(String, String)>>,
        next_pr_number: AtomicU64,
    }

    impl StubVcs {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                check_script: Mutex::new(VecDeque::new()),
                last_check: Mutex::new(None),
                mergeable: Mutex::new(Some(true)),
                conflicts: Mutex::new(false),
                merged: Mutex::new(Vec::new()),
                merge_error: Mutex::new(None),
                deleted_branches: Mutex::new(Vec::new()),
                delete_error: Mutex::new(None),
                created_prs: Mutex::new(Vec::new()),
                next_pr_number: AtomicU64::new(1),
            })
        }

        pub(crate) fn script_checks(&self, script: Vec<Result<CheckStatus>>) {
            *self.check_script.lock().unwrap() = script.into();
        }

        pub(crate) fn terminal_checks(jobs: Vec<CiJobResult>) -> CheckStatus {
            CheckStatus {
                pending: false,
                jobs,
            }
        }
    }

    #[async_trait]
    impl VcsService for StubVcs {
        fn clone_url(&self, owner: &str, repo: &str) -> String {
            format!("https://example.test/{owner}/{repo}.git")
        }

        async fn create_pull_request(
            &self,
            owner: &str,
            repo: &str,
            head: &str,
            base: &str,
            _title: &str,
            _body: &str,
        ) -> Result<PrRef> {
            self.created_prs
                .lock()
                .unwrap()
                .push((head.to_string(), base.to_string()));
            Ok(PrRef {
                owner: owner.to_string(),
                repo: repo.to_string(),
                number: self.next_pr_number.fetch_add(1, Ordering::Relaxed),
            })
        }

        async fn get_pull_request_status(&self, _pr: &PrRef) -> Result<PrStatus> {
            Ok(PrStatus {
                state: "OPEN".to_string(),
                mergeable: *self.mergeable.lock().unwrap(),
            })
        }

        async fn is_pr_mergeable(&self, _pr: &PrRef) -> Result<Option<bool>> {
            Ok(*self.mergeable.lock().unwrap())
        }

        async fn check_pr_conflicts(&self, _pr: &PrRef) -> Result<bool> {
            Ok(*self.conflicts.lock().unwrap())
        }

        async fn get_pr_check_status(&self, _pr: &PrRef) -> Result<CheckStatus> {
            let next = self.check_script.lock().unwrap().pop_front();
            match next {
                Some(Ok(status)) => {
                    *self.last_check.lock().unwrap() = Some(status.clone());
                    Ok(status)
                }
                Some(Err(e)) => Err(e),
                None => Ok(self.last_check.lock().unwrap().clone().unwrap_or(
                    CheckStatus {
                        pending: true,
                        jobs: Vec::new(),
                    },
                )),
            }
        }

        async fn merge_pr(
            &self,
            pr: &PrRef,
            method: MergeMethod,
            delete_branch: bool,
        ) -> Result<()> {
            if let Some(msg) = self.merge_error.lock().unwrap().clone() {
                return Err(VcsError::CommandFailed(msg));
            }
            self.merged
                .lock()
                .unwrap()
                .push((pr.number, method, delete_branch));
            Ok(())
        }

        async fn delete_pr_branch(&self, pr: &PrRef) -> Result<()> {
            if let Some(msg) = self.delete_error.lock().unwrap().clone() {
                return Err(VcsError::CommandFailed(msg));
            }
            self.deleted_branches.lock().unwrap().push(pr.number);
            Ok(())
        }
    }
}
