//! Daemon configuration.
//!
//! Loaded from a TOML file with every field defaultable, so an empty file
//! (or no file at all) yields a working local setup.

use crate::types::{DriveMode, MergeMethod, WorkspaceKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonSection,
    pub repo: RepoSection,
    pub worker: WorkerSection,
    pub workspace: WorkspaceSection,
    pub executor: ExecutorSection,
    pub ci: CiSection,
    pub merge: MergeSection,
    pub orchestrator: OrchestratorSection,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    /// Path to the SQLite database.
    pub db_path: PathBuf,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("pilot.db"),
        }
    }
}

/// Default data directory (~/.local/share/pilotd).
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pilotd")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoSection {
    pub owner: String,
    pub name: String,
    /// Tracked default branch of the target repository.
    pub default_branch: String,
}

impl Default for RepoSection {
    fn default() -> Self {
        Self {
            owner: String::new(),
            name: String::new(),
            default_branch: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// Stable identity recorded in `locked_by` on claimed jobs.
    pub worker_id: String,
    /// Sleep between claim attempts when idle or at capacity, in ms.
    pub poll_interval_ms: u64,
    pub max_concurrent: usize,
    /// Default attempt budget for newly enqueued jobs.
    pub max_attempts: u32,
    /// Delay before a failed job becomes claimable again, in seconds.
    pub retry_delay_sec: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", std::process::id()),
            poll_interval_ms: 500,
            max_concurrent: 3,
            max_attempts: 3,
            retry_delay_sec: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceSection {
    /// Directory under which per-run workspaces are created.
    pub root: PathBuf,
    pub strategy: WorkspaceKind,
    pub branch_prefix: String,
    /// Bounded retry budget for non-fast-forward push races.
    pub push_retries: u32,
}

impl Default for WorkspaceSection {
    fn default() -> Self {
        Self {
            root: default_data_dir().join("workspaces"),
            strategy: WorkspaceKind::Clone,
            branch_prefix: "pilot/".to_string(),
            push_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    /// Agent CLI binary invoked for coding, fixing, and review passes.
    pub bin: PathBuf,
    /// Extra arguments placed before the instruction.
    pub args: Vec<String>,
    /// Per-invocation timeout in seconds (0 = no timeout).
    pub timeout_sec: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            bin: PathBuf::from("claude"),
            args: vec!["-p".to_string(), "--dangerously-skip-permissions".to_string()],
            timeout_sec: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CiSection {
    pub poll_interval_sec: u64,
    /// Give up polling after this long, in seconds.
    pub timeout_sec: u64,
    /// Maximum characters of failure log kept per failed job.
    pub log_excerpt_chars: usize,
}

impl Default for CiSection {
    fn default() -> Self {
        Self {
            poll_interval_sec: 30,
            timeout_sec: 3600,
            log_excerpt_chars: 4000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeSection {
    /// Minimum review score required by the merge gate.
    pub review_threshold: f64,
    pub method: MergeMethod,
    pub delete_branch: bool,
}

impl Default for MergeSection {
    fn default() -> Self {
        Self {
            review_threshold: 0.75,
            method: MergeMethod::Squash,
            delete_branch: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub mode: DriveMode,
    pub max_ci_iterations: u32,
    pub max_review_iterations: u32,
    /// Total phase-loop iteration budget across all fix loops.
    pub max_total_iterations: u32,
    /// Wall-clock budget for a whole cycle, in seconds.
    pub cycle_timeout_sec: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            mode: DriveMode::FullAuto,
            max_ci_iterations: 3,
            max_review_iterations: 2,
            max_total_iterations: 10,
            cycle_timeout_sec: 4 * 3600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.worker.max_concurrent, 3);
        assert_eq!(config.merge.review_threshold, 0.75);
        assert_eq!(config.orchestrator.max_ci_iterations, 3);
        assert_eq!(config.workspace.strategy, WorkspaceKind::Clone);
        assert_eq!(config.repo.default_branch, "main");
    }

    #[test]
    fn from_file_partial_overrides() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pilot.toml");
        std::fs::write(
            &path,
            r#"
[repo]
owner = "acme"
name = "widgets"

[orchestrator]
mode = "semi_auto"
max_ci_iterations = 5
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.repo.owner, "acme");
        assert_eq!(config.repo.name, "widgets");
        assert_eq!(config.orchestrator.mode, DriveMode::SemiAuto);
        assert_eq!(config.orchestrator.max_ci_iterations, 5);
        // Untouched sections keep their defaults.
        assert_eq!(config.worker.poll_interval_ms, 500);
    }

    #[test]
    fn from_file_empty_file_is_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pilot.toml");
        std::fs::write(&path, "").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.worker.max_attempts, 3);
    }

    #[test]
    fn from_file_rejects_invalid_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pilot.toml");
        std::fs::write(&path, "not [valid").unwrap();

        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::Parse(_))
        ));
    }
}
