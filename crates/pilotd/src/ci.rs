//! CI polling service.
//!
//! One polling loop per task watches the combined check status of that
//! task's pull request. Transient provider errors are retried on the
//! next tick and never end the loop; only a terminal check status, the
//! configured timeout, or explicit cancellation does. The terminal
//! outcome is delivered through a one-shot callback so the orchestrator
//! and the poller stay decoupled.

use pilot_core::config::CiSection;
use pilot_core::{CiJobResult, CiResult, PrRef};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::vcs::VcsService;

/// Terminal outcome of one polling loop.
#[derive(Debug)]
pub enum CiOutcome {
    Completed(CiResult),
    TimedOut,
}

/// Invoked exactly once when a polling loop ends with an outcome.
/// A stopped or replaced loop ends silently instead.
pub type CiCallback = Box<dyn FnOnce(CiOutcome) + Send>;

struct ActivePoll {
    generation: u64,
    token: CancellationToken,
}

pub struct CiPoller {
    vcs: Arc<dyn VcsService>,
    interval: Duration,
    timeout: Duration,
    excerpt_chars: usize,
    active: Mutex<HashMap<String, ActivePoll>>,
    generation: AtomicU64,
}

impl CiPoller {
    pub fn new(
        vcs: Arc<dyn VcsService>,
        interval: Duration,
        timeout: Duration,
        excerpt_chars: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            vcs,
            interval,
            timeout,
            excerpt_chars,
            active: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        })
    }

    pub fn from_config(cfg: &CiSection, vcs: Arc<dyn VcsService>) -> Arc<Self> {
        Self::new(
            vcs,
            Duration::from_secs(cfg.poll_interval_sec),
            Duration::from_secs(cfg.timeout_sec),
            cfg.log_excerpt_chars,
        )
    }

    /// Start polling CI for a task's pull request. Any existing loop
    /// for the same task is stopped and replaced.
    pub fn start_polling(self: &Arc<Self>, task_id: &str, pr: PrRef, on_outcome: CiCallback) {
        let token = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut active = self.lock_active();
            if let Some(prev) = active.insert(
                task_id.to_string(),
                ActivePoll {
                    generation,
                    token: token.clone(),
                },
            ) {
                debug!(task_id, "replacing existing CI polling loop");
                prev.token.cancel();
            }
        }

        info!(task_id, pr = %pr, "starting CI polling");
        let poller = Arc::clone(self);
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            let outcome = poller.poll_loop(&task_id, &pr, &token).await;
            poller.deregister(&task_id, generation);
            if let Some(outcome) = outcome {
                on_outcome(outcome);
            }
        });
    }

    /// Stop the polling loop for a task, if one is running. The loop
    /// ends without invoking its callback.
    pub fn stop_polling(&self, task_id: &str) -> bool {
        let mut active = self.lock_active();
        match active.remove(task_id) {
            Some(poll) => {
                info!(task_id, "stopping CI polling");
                poll.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_polling(&self, task_id: &str) -> bool {
        self.lock_active().contains_key(task_id)
    }

    /// Stop every active loop. Used at daemon shutdown.
    pub fn stop_all(&self) {
        let mut active = self.lock_active();
        for (task_id, poll) in active.drain() {
            debug!(task_id, "stopping CI polling at shutdown");
            poll.token.cancel();
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActivePoll>> {
        // Lock poisoning means a panic with the map held; the map stays
        // usable either way.
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deregister(&self, task_id: &str, generation: u64) {
        let mut active = self.lock_active();
        // A replacement loop may have taken our slot; only remove our own.
        if active.get(task_id).is_some_and(|p| p.generation == generation) {
            active.remove(task_id);
        }
    }

    /// Returns `None` when the loop was cancelled.
    async fn poll_loop(
        &self,
        task_id: &str,
        pr: &PrRef,
        token: &CancellationToken,
    ) -> Option<CiOutcome> {
        let started = Instant::now();

        loop {
            if started.elapsed() >= self.timeout {
                warn!(task_id, pr = %pr, "CI polling timed out");
                return Some(CiOutcome::TimedOut);
            }

            match self.vcs.get_pr_check_status(pr).await {
                Ok(status) if status.pending => {
                    debug!(task_id, jobs = status.jobs.len(), "CI still pending");
                }
                Ok(status) => {
                    let result = self.fold_result(status.jobs);
                    info!(
                        task_id,
                        success = result.success,
                        failed = result.failed_jobs.len(),
                        "CI reached terminal status"
                    );
                    return Some(CiOutcome::Completed(result));
                }
                Err(e) => {
                    // Transient until proven otherwise. Next tick retries.
                    warn!(task_id, error = %e, "CI status poll failed, will retry");
                }
            }

            tokio::select! {
                () = token.cancelled() => {
                    debug!(task_id, "CI polling cancelled");
                    return None;
                }
                () = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    fn fold_result(&self, mut jobs: Vec<CiJobResult>) -> CiResult {
        for job in &mut jobs {
            if let Some(excerpt) = &mut job.log_excerpt {
                if excerpt.len() > self.excerpt_chars {
                    let mut cut = self.excerpt_chars;
                    while !excerpt.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    excerpt.truncate(cut);
                }
            }
        }
        CiResult::from_jobs(jobs)
    }
}
