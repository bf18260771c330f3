//! Merge gate: the conditions a pull request must clear before an
//! automated merge.
//!
//! Conditions are evaluated independently against the provider and
//! ANDed, each with a human-readable message. The merge path re-checks
//! everything immediately before merging; a check result is never
//! trusted across the gap.

use pilot_core::{MergeMethod, PrRef};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::vcs::{VcsError, VcsService};

#[derive(Debug, Error)]
pub enum MergeGateError {
    #[error("vcs error: {0}")]
    Vcs(#[from] VcsError),
    #[error("merge blocked by failed conditions: {0}")]
    Blocked(String),
}

pub type Result<T> = std::result::Result<T, MergeGateError>;

/// One merge precondition with its verdict.
#[derive(Debug, Clone)]
pub struct MergeCondition {
    pub name: &'static str,
    pub passed: bool,
    pub message: String,
}

/// Aggregate verdict across all conditions.
#[derive(Debug, Clone)]
pub struct MergeCheck {
    pub can_merge: bool,
    pub conditions: Vec<MergeCondition>,
    /// Names of the conditions that failed.
    pub failed: Vec<String>,
}

impl MergeCheck {
    fn from_conditions(conditions: Vec<MergeCondition>) -> Self {
        let failed: Vec<String> = conditions
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.to_string())
            .collect();
        Self {
            can_merge: failed.is_empty(),
            conditions,
            failed,
        }
    }
}

pub struct MergeGate {
    vcs: Arc<dyn VcsService>,
    review_threshold: f64,
}

impl MergeGate {
    pub fn new(vcs: Arc<dyn VcsService>, review_threshold: f64) -> Self {
        Self {
            vcs,
            review_threshold,
        }
    }

    /// Evaluate every merge precondition for a pull request.
    ///
    /// `last_review_score` is the most recent automated review score;
    /// `None` counts as a failing review condition.
    pub async fn check_all_conditions(
        &self,
        pr: &PrRef,
        last_review_score: Option<f64>,
    ) -> Result<MergeCheck> {
        let mut conditions = Vec::with_capacity(4);

        let checks = self.vcs.get_pr_check_status(pr).await?;
        let ci_green = !checks.pending
            && checks
                .jobs
                .iter()
                .all(|j| j.result == "success" || j.result == "skipped");
        conditions.push(MergeCondition {
            name: "CI Status",
            passed: ci_green,
            message: if checks.pending {
                "CI checks are still running".to_string()
            } else if ci_green {
                "all CI checks passed".to_string()
            } else {
                let failing: Vec<&str> = checks
                    .jobs
                    .iter()
                    .filter(|j| j.result != "success" && j.result != "skipped")
                    .map(|j| j.job_name.as_str())
                    .collect();
                format!("failing CI checks: {}", failing.join(", "))
            },
        });

        let review_passed =
            last_review_score.is_some_and(|score| score >= self.review_threshold);
        conditions.push(MergeCondition {
            name: "Review Score",
            passed: review_passed,
            message: match last_review_score {
                Some(score) => format!(
                    "review score {score:.2} vs threshold {:.2}",
                    self.review_threshold
                ),
                None => "no review score recorded".to_string(),
            },
        });

        let has_conflicts = self.vcs.check_pr_conflicts(pr).await?;
        conditions.push(MergeCondition {
            name: "Merge Conflicts",
            passed: !has_conflicts,
            message: if has_conflicts {
                "branch has conflicts with the base".to_string()
            } else {
                "no merge conflicts".to_string()
            },
        });

        let mergeable = self.vcs.is_pr_mergeable(pr).await?;
        conditions.push(MergeCondition {
            name: "Mergeable",
            // An in-flight mergeability computation is not a pass.
            passed: mergeable == Some(true),
            message: match mergeable {
                Some(true) => "provider reports the PR as mergeable".to_string(),
                Some(false) => "provider reports the PR as not mergeable".to_string(),
                None => "provider is still computing mergeability".to_string(),
            },
        });

        Ok(MergeCheck::from_conditions(conditions))
    }

    /// Merge the pull request after re-checking every condition.
    ///
    /// Branch deletion is best effort; its failure never fails a merge
    /// that already happened.
    pub async fn merge(
        &self,
        pr: &PrRef,
        last_review_score: Option<f64>,
        method: MergeMethod,
        delete_branch: bool,
    ) -> Result<()> {
        let check = self.check_all_conditions(pr, last_review_score).await?;
        if !check.can_merge {
            return Err(MergeGateError::Blocked(check.failed.join(", ")));
        }

        self.vcs.merge_pr(pr, method, false).await?;
        info!(pr = %pr, ?method, "merged pull request");

        if delete_branch {
            if let Err(e) = self.vcs.delete_pr_branch(pr).await {
                warn!(pr = %pr, error = %e, "branch deletion failed after merge");
            }
        }
        Ok(())
    }
}

/// Remediation hint for a failing CI job, keyed on name patterns.
/// Feeds the instruction built for the next CI-fix pass.
pub fn get_fix_strategy(job_name: &str) -> &'static str {
    const STRATEGIES: &[(&str, &str)] = &[
        ("lint", "Run the project's linter locally and fix every reported violation."),
        ("format", "Run the project's code formatter and commit the result."),
        ("typecheck", "Fix the type errors reported by the type checker."),
        ("types", "Fix the type errors reported by the type checker."),
        ("test", "Run the failing test suite locally and fix the failing tests without deleting them."),
        ("build", "Fix the compilation or build errors; do not change build configuration to mask them."),
        ("compile", "Fix the compilation or build errors; do not change build configuration to mask them."),
        ("audit", "Resolve the reported dependency or security findings."),
        ("security", "Resolve the reported dependency or security findings."),
        ("doc", "Fix the documentation build errors."),
    ];

    let lowered = job_name.to_lowercase();
    for (pattern, hint) in STRATEGIES {
        if word_start_match(&lowered, pattern) {
            return hint;
        }
    }
    "Inspect the CI job's failure log and fix the underlying issue."
}

/// True when `pattern` occurs in `name` at the start of a word. A raw
/// substring search would let runner suffixes like "(ubuntu-latest)"
/// match "test" for every job.
fn word_start_match(name: &str, pattern: &str) -> bool {
    let bytes = name.as_bytes();
    let mut from = 0;
    while let Some(pos) = name[from..].find(pattern) {
        let begin = from + pos;
        if begin == 0 || !bytes[begin - 1].is_ascii_alphanumeric() {
            return true;
        }
        from = begin + 1;
    }
    false
}
