//! Job worker: claims queued jobs and drives them through handlers.
//!
//! Dispatch is a fixed registry with one handler slot per job kind;
//! kinds and handlers are wired once at construction. The worker owns
//! bounded concurrency, cooperative cancellation of in-flight jobs, and
//! the conservative startup recovery that fails anything left running
//! by a previous process.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use pilot_core::{Job, JobKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::storage::Storage;

/// Error recorded on jobs found running at startup.
const RESTART_ERROR: &str = "worker restarted mid-execution";

#[derive(Debug, Error)]
pub enum HandlerError {
    /// The job's cancellation token fired and the handler stopped.
    #[error("job canceled")]
    Canceled,
    /// Anything else; the text is persisted on the job row.
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(err: impl std::fmt::Display) -> Self {
        Self::Failed(err.to_string())
    }
}

pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Executes one kind of job. Handlers own any subprocess they spawn and
/// must terminate it when the cancellation token fires.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job, cancel: CancellationToken) -> HandlerResult;
}

/// One handler per job kind, fixed at construction.
pub struct HandlerRegistry {
    coding: Arc<dyn JobHandler>,
    fix_ci: Arc<dyn JobHandler>,
    fix_review: Arc<dyn JobHandler>,
    review: Arc<dyn JobHandler>,
}

impl HandlerRegistry {
    pub fn new(
        coding: Arc<dyn JobHandler>,
        fix_ci: Arc<dyn JobHandler>,
        fix_review: Arc<dyn JobHandler>,
        review: Arc<dyn JobHandler>,
    ) -> Self {
        Self {
            coding,
            fix_ci,
            fix_review,
            review,
        }
    }

    /// A registry routing every kind to the same handler.
    pub fn uniform(handler: Arc<dyn JobHandler>) -> Self {
        Self {
            coding: Arc::clone(&handler),
            fix_ci: Arc::clone(&handler),
            fix_review: Arc::clone(&handler),
            review: handler,
        }
    }

    fn get(&self, kind: JobKind) -> Arc<dyn JobHandler> {
        match kind {
            JobKind::Coding => Arc::clone(&self.coding),
            JobKind::FixCi => Arc::clone(&self.fix_ci),
            JobKind::FixReview => Arc::clone(&self.fix_review),
            JobKind::Review => Arc::clone(&self.review),
        }
    }
}

struct InflightJob {
    kind: JobKind,
    ref_id: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Worker {
    storage: Arc<Storage>,
    handlers: HandlerRegistry,
    worker_id: String,
    poll_interval: Duration,
    max_concurrent: usize,
    retry_delay: ChronoDuration,
    shutdown: CancellationToken,
    inflight: Mutex<HashMap<String, InflightJob>>,
}

impl Worker {
    pub fn new(
        storage: Arc<Storage>,
        handlers: HandlerRegistry,
        worker_id: String,
        poll_interval: Duration,
        max_concurrent: usize,
        retry_delay: ChronoDuration,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            handlers,
            worker_id,
            poll_interval,
            max_concurrent,
            retry_delay,
            shutdown: CancellationToken::new(),
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// Fail every job left in `running` by a previous process. The
    /// in-process state behind those rows is unrecoverable; resuming
    /// would mean guessing. Returns the number of rows affected.
    pub async fn recover_startup(&self) -> crate::storage::Result<u64> {
        let count = self.storage.fail_all_running(RESTART_ERROR).await?;
        if count > 0 {
            warn!(count, "failed jobs left running by a previous process");
        }
        Ok(count)
    }

    /// Main claim loop. Returns after [`Worker::shutdown`] once every
    /// in-flight job has been cancelled and awaited.
    pub async fn run(self: Arc<Self>) {
        info!(
            worker_id = %self.worker_id,
            max_concurrent = self.max_concurrent,
            "worker started"
        );

        while !self.shutdown.is_cancelled() {
            self.prune_finished();

            if self.inflight_count() >= self.max_concurrent {
                self.idle().await;
                continue;
            }

            match self.storage.claim_next_job(&self.worker_id).await {
                Ok(Some(job)) => self.spawn_job(job),
                Ok(None) => self.idle().await,
                Err(e) => {
                    error!(error = %e, "claim failed");
                    self.idle().await;
                }
            }
        }

        self.drain().await;
        info!(worker_id = %self.worker_id, "worker stopped");
    }

    /// Signal the claim loop to stop. In-flight jobs are cancelled and
    /// awaited by the loop before `run` returns.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn inflight_count(&self) -> usize {
        self.lock_inflight().len()
    }

    /// Cancel all queued jobs for a (kind, ref_id) pair in the store,
    /// and cancel any matching job running under this worker. The
    /// handler owning a subprocess is responsible for killing it.
    ///
    /// Returns the number of queued jobs canceled.
    pub async fn cancel_ref(&self, kind: JobKind, ref_id: &str) -> crate::storage::Result<u64> {
        let count = self.storage.cancel_jobs_by_ref(kind, ref_id).await?;

        let inflight = self.lock_inflight();
        for (job_id, entry) in inflight.iter() {
            if entry.kind == kind && entry.ref_id == ref_id {
                info!(job_id, ref_id, "cancelling in-flight job");
                entry.cancel.cancel();
            }
        }
        drop(inflight);

        Ok(count)
    }

    async fn idle(&self) {
        tokio::select! {
            () = self.shutdown.cancelled() => {}
            () = tokio::time::sleep(self.poll_interval) => {}
        }
    }

    fn spawn_job(self: &Arc<Self>, job: Job) {
        let job_id = job.id.to_string();
        let kind = job.kind;
        let ref_id = job.ref_id.clone();
        let cancel = CancellationToken::new();

        debug!(job_id, kind = kind.as_str(), ref_id, attempt = job.attempts, "dispatching job");

        let worker = Arc::clone(self);
        let handler = self.handlers.get(kind);
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let id = job.id.clone();
            let result = handler.handle(job, task_cancel).await;
            worker.settle(&id, result).await;
        });

        self.lock_inflight().insert(
            job_id,
            InflightJob {
                kind,
                ref_id,
                cancel,
                handle,
            },
        );
    }

    /// Persist a finished handler's outcome. Errors here mean the store
    /// is unavailable; nothing to do but log.
    async fn settle(&self, job_id: &pilot_core::Id, result: HandlerResult) {
        let outcome = match result {
            Ok(()) => {
                info!(job_id = %job_id, "job succeeded");
                self.storage.complete_job(job_id).await
            }
            Err(HandlerError::Canceled) => {
                info!(job_id = %job_id, "job canceled");
                self.storage.mark_job_canceled(job_id).await
            }
            Err(HandlerError::Failed(msg)) => {
                warn!(job_id = %job_id, error = %msg, "job failed");
                match self.storage.fail_job(job_id, &msg, self.retry_delay).await {
                    Ok(status) => {
                        debug!(job_id = %job_id, status = status.as_str(), "job failure recorded");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        };
        if let Err(e) = outcome {
            error!(job_id = %job_id, error = %e, "failed to record job outcome");
        }
    }

    fn prune_finished(&self) {
        self.lock_inflight().retain(|_, entry| !entry.handle.is_finished());
    }

    async fn drain(&self) {
        let entries: Vec<InflightJob> = {
            let mut inflight = self.lock_inflight();
            inflight.drain().map(|(_, v)| v).collect()
        };
        if entries.is_empty() {
            return;
        }
        info!(count = entries.len(), "cancelling in-flight jobs for shutdown");
        for entry in &entries {
            entry.cancel.cancel();
        }
        for entry in entries {
            if let Err(e) = entry.handle.await {
                warn!(error = %e, "job task join failed during drain");
            }
        }
    }

    fn lock_inflight(&self) -> std::sync::MutexGuard<'_, HashMap<String, InflightJob>> {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_core::{Id, JobStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct TestEnv {
        storage: Arc<Storage>,
        _dir: TempDir,
    }

    async fn setup() -> TestEnv {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(&dir.path().join("test.db")).await.unwrap());
        storage.migrate_embedded().await.unwrap();
        TestEnv { storage, _dir: dir }
    }

    fn make_worker(storage: Arc<Storage>, handler: Arc<dyn JobHandler>, max: usize) -> Arc<Worker> {
        Worker::new(
            storage,
            HandlerRegistry::uniform(handler),
            "test-worker".to_string(),
            Duration::from_millis(10),
            max,
            ChronoDuration::zero(),
        )
    }

    async fn wait_for_status(storage: &Storage, id: &Id, status: JobStatus) {
        for _ in 0..500 {
            if storage.get_job(id).await.unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "job never reached {:?}, currently {:?}",
            status,
            storage.get_job(id).await.unwrap().status
        );
    }

    /// Handler that succeeds immediately, counting invocations.
    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: Job, _cancel: CancellationToken) -> HandlerResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Handler that fails until `succeed_after` invocations have happened.
    struct FlakyHandler {
        calls: AtomicUsize,
        succeed_after: usize,
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn handle(&self, _job: Job, _cancel: CancellationToken) -> HandlerResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.succeed_after {
                Err(HandlerError::Failed(format!("transient failure {call}")))
            } else {
                Ok(())
            }
        }
    }

    /// Handler that blocks until cancelled.
    struct BlockingHandler;

    #[async_trait]
    impl JobHandler for BlockingHandler {
        async fn handle(&self, _job: Job, cancel: CancellationToken) -> HandlerResult {
            cancel.cancelled().await;
            Err(HandlerError::Canceled)
        }
    }

    #[tokio::test]
    async fn successful_job_completes() {
        let env = setup().await;
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        let worker = make_worker(Arc::clone(&env.storage), Arc::clone(&handler) as _, 2);

        let id = env
            .storage
            .enqueue_job(JobKind::Coding, "task-1", "{}", 1, ChronoDuration::zero())
            .await
            .unwrap();

        let run = tokio::spawn(Arc::clone(&worker).run());
        wait_for_status(&env.storage, &id, JobStatus::Succeeded).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        worker.shutdown();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn failing_job_retries_then_succeeds() {
        let env = setup().await;
        let handler = Arc::new(FlakyHandler {
            calls: AtomicUsize::new(0),
            succeed_after: 2,
        });
        let worker = make_worker(Arc::clone(&env.storage), Arc::clone(&handler) as _, 2);

        let id = env
            .storage
            .enqueue_job(JobKind::FixCi, "task-1", "{}", 3, ChronoDuration::zero())
            .await
            .unwrap();

        let run = tokio::spawn(Arc::clone(&worker).run());
        wait_for_status(&env.storage, &id, JobStatus::Succeeded).await;

        let job = env.storage.get_job(&id).await.unwrap();
        assert_eq!(job.attempts, 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        worker.shutdown();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_attempts_leave_job_terminally_failed() {
        let env = setup().await;
        let handler = Arc::new(FlakyHandler {
            calls: AtomicUsize::new(0),
            succeed_after: usize::MAX,
        });
        let worker = make_worker(Arc::clone(&env.storage), handler, 2);

        let id = env
            .storage
            .enqueue_job(JobKind::Coding, "task-1", "{}", 2, ChronoDuration::zero())
            .await
            .unwrap();

        let run = tokio::spawn(Arc::clone(&worker).run());
        wait_for_status(&env.storage, &id, JobStatus::Failed).await;

        let job = env.storage.get_job(&id).await.unwrap();
        assert_eq!(job.attempts, 2);
        assert!(job.error.unwrap().contains("transient failure"));

        worker.shutdown();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_ref_stops_running_and_queued_jobs() {
        let env = setup().await;
        let worker = make_worker(Arc::clone(&env.storage), Arc::new(BlockingHandler), 1);

        // First job runs (and blocks); second stays queued behind the
        // concurrency limit.
        let running = env
            .storage
            .enqueue_job(JobKind::Coding, "task-1", "{}", 1, ChronoDuration::zero())
            .await
            .unwrap();
        let queued = env
            .storage
            .enqueue_job(JobKind::Coding, "task-1", "{}", 1, ChronoDuration::zero())
            .await
            .unwrap();

        let run = tokio::spawn(Arc::clone(&worker).run());
        wait_for_status(&env.storage, &running, JobStatus::Running).await;

        let canceled_queued = worker.cancel_ref(JobKind::Coding, "task-1").await.unwrap();
        assert_eq!(canceled_queued, 1);

        wait_for_status(&env.storage, &running, JobStatus::Canceled).await;
        wait_for_status(&env.storage, &queued, JobStatus::Canceled).await;

        worker.shutdown();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn concurrency_limit_bounds_inflight_jobs() {
        let env = setup().await;
        let worker = make_worker(Arc::clone(&env.storage), Arc::new(BlockingHandler), 1);

        let first = env
            .storage
            .enqueue_job(JobKind::Coding, "task-1", "{}", 1, ChronoDuration::zero())
            .await
            .unwrap();
        let second = env
            .storage
            .enqueue_job(JobKind::Coding, "task-2", "{}", 1, ChronoDuration::zero())
            .await
            .unwrap();

        let run = tokio::spawn(Arc::clone(&worker).run());
        wait_for_status(&env.storage, &first, JobStatus::Running).await;

        // The second job must not be claimed while the first blocks.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            env.storage.get_job(&second).await.unwrap().status,
            JobStatus::Queued
        );
        assert_eq!(worker.inflight_count(), 1);

        worker.shutdown();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn recover_startup_fails_running_rows() {
        let env = setup().await;
        env.storage
            .enqueue_job(JobKind::Coding, "task-1", "{}", 1, ChronoDuration::zero())
            .await
            .unwrap();
        env.storage.claim_next_job("dead-worker").await.unwrap().unwrap();

        let worker = make_worker(
            Arc::clone(&env.storage),
            Arc::new(CountingHandler {
                calls: AtomicUsize::new(0),
            }),
            2,
        );
        let count = worker.recover_startup().await.unwrap();
        assert_eq!(count, 1);

        let stats = env.storage.job_stats().await.unwrap();
        assert_eq!(stats.running, 0);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn shutdown_cancels_inflight_jobs() {
        let env = setup().await;
        let worker = make_worker(Arc::clone(&env.storage), Arc::new(BlockingHandler), 2);

        let id = env
            .storage
            .enqueue_job(JobKind::Coding, "task-1", "{}", 1, ChronoDuration::zero())
            .await
            .unwrap();

        let run = tokio::spawn(Arc::clone(&worker).run());
        wait_for_status(&env.storage, &id, JobStatus::Running).await;

        worker.shutdown();
        run.await.unwrap();

        assert_eq!(
            env.storage.get_job(&id).await.unwrap().status,
            JobStatus::Canceled
        );
    }
}
