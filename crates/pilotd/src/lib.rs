//! pilotd - autonomous coding-agent orchestration daemon.
//!
//! Library components for the daemon process: persistent job store and
//! worker, git workspace isolation, agent executor and VCS adapters,
//! CI polling, merge gate, and the agentic state machine composing
//! them.

pub mod ci;
pub mod coordinator;
pub mod executor;
pub mod git;
pub mod merge_gate;
pub mod orchestrator;
pub mod storage;
pub mod vcs;
pub mod worker;
pub mod workspace;

use chrono::Duration as ChronoDuration;
use pilot_core::{Config, WorkspaceKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use ci::CiPoller;
use coordinator::Coordinator;
use executor::CliAgentExecutor;
use orchestrator::{Orchestrator, TracingNotifier};
use storage::Storage;
use vcs::{GhCliVcs, VcsService};
use worker::Worker;
use workspace::{CloneStrategy, WorkspaceManager, WorkspaceStrategy, WorktreeStrategy};

/// Daemon state: the fully wired service graph. All collaborators are
/// constructed once here and passed down explicitly.
pub struct Daemon {
    config: Config,
    storage: Arc<Storage>,
    worker: Arc<Worker>,
    orchestrator: Arc<Orchestrator>,
}

impl Daemon {
    pub async fn new(config: Config) -> eyre::Result<Self> {
        if let Some(parent) = config.daemon.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let storage = Arc::new(Storage::new(&config.daemon.db_path).await?);
        storage.migrate_embedded().await?;

        let vcs: Arc<dyn VcsService> = Arc::new(GhCliVcs::new());
        let clone_url = vcs.clone_url(&config.repo.owner, &config.repo.name);

        let strategy: Box<dyn WorkspaceStrategy> = match config.workspace.strategy {
            WorkspaceKind::Clone => Box::new(CloneStrategy::new(clone_url.clone())),
            WorkspaceKind::Worktree => {
                let base = base_repo_path(&config);
                ensure_base_repo(&base, &clone_url, &config.repo.default_branch).await?;
                Box::new(WorktreeStrategy::new(base))
            }
        };
        let workspaces = Arc::new(WorkspaceManager::new(
            config.workspace.root.clone(),
            config.workspace.branch_prefix.clone(),
            config.workspace.push_retries,
            strategy,
        ));

        let executor = Arc::new(CliAgentExecutor::new(&config.executor));
        let coordinator = Coordinator::new(
            Arc::clone(&storage),
            workspaces,
            executor,
            config.repo.default_branch.clone(),
        );
        let ci = CiPoller::from_config(&config.ci, Arc::clone(&vcs));

        let orchestrator = Orchestrator::new(
            Arc::clone(&storage),
            coordinator,
            ci,
            vcs,
            Arc::new(TracingNotifier),
            config.repo.clone(),
            config.merge.clone(),
            config.orchestrator.clone(),
            config.worker.max_attempts,
        );

        let worker = Worker::new(
            Arc::clone(&storage),
            orchestrator.registry(),
            config.worker.worker_id.clone(),
            Duration::from_millis(config.worker.poll_interval_ms),
            config.worker.max_concurrent,
            ChronoDuration::seconds(config.worker.retry_delay_sec as i64),
        );
        orchestrator.attach_worker(Arc::clone(&worker));

        Ok(Self {
            config,
            storage,
            worker,
            orchestrator,
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Run the daemon: recover state left by a previous process, then
    /// drive the worker claim loop until shutdown.
    pub async fn run(&self) -> eyre::Result<()> {
        info!(
            db = %self.config.daemon.db_path.display(),
            owner = %self.config.repo.owner,
            repo = %self.config.repo.name,
            worker_id = %self.config.worker.worker_id,
            max_concurrent = self.config.worker.max_concurrent,
            "pilotd starting"
        );

        // Jobs first, then states: recovery routing for execution
        // phases depends on the jobs already being failed.
        let failed = self.worker.recover_startup().await?;
        if failed > 0 {
            info!(count = failed, "recovered orphaned jobs from previous process");
        }
        self.orchestrator.recover().await?;

        Arc::clone(&self.worker).run().await;
        Ok(())
    }

    /// Signal graceful shutdown: the worker stops claiming, cancels
    /// in-flight jobs, and `run` returns.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.worker.shutdown();
    }
}

fn base_repo_path(config: &Config) -> PathBuf {
    config.workspace.root.join(".base")
}

/// Worktree strategy needs one shared repository to hang worktrees
/// off; clone it on first start.
async fn ensure_base_repo(base: &std::path::Path, url: &str, default_branch: &str) -> eyre::Result<()> {
    if git::is_git_repo(base) {
        return Ok(());
    }
    info!(path = %base.display(), "cloning base repository for worktrees");
    let base = base.to_path_buf();
    let url = url.to_string();
    let branch = default_branch.to_string();
    tokio::task::spawn_blocking(move || {
        git::shallow_clone(&url, &base, &branch, workspace::CLONE_DEPTH)
    })
    .await??;
    Ok(())
}
