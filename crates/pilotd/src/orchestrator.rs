//! Agentic orchestrator: the phase state machine driving a task from
//! first agent invocation to a merged pull request.
//!
//! Happy path: CODING -> WAITING_CI -> REVIEWING -> MERGE_CHECK ->
//! MERGING -> COMPLETED. CI failures loop through FIXING_CI, low review
//! scores through FIXING_REVIEW, both under iteration budgets; every
//! path lands in COMPLETED or FAILED with a persisted reason.
//!
//! Execution phases (coding, fixes, review) run as queued jobs under
//! the worker; CI waiting runs as a polling loop. The two sides only
//! meet through the persisted [`AgenticState`].

use pilot_core::config::{MergeSection, OrchestratorSection, RepoSection};
use pilot_core::{
    AgenticState, CiResult, DriveMode, Id, JobKind, Phase, PrRef, ReviewPayload, ReviewResult,
    RunPayload,
};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ci::{CiOutcome, CiPoller};
use crate::coordinator::{Coordinator, CoordinatorError};
use crate::merge_gate::{get_fix_strategy, MergeGate, MergeGateError};
use crate::storage::{Storage, StorageError};
use crate::vcs::{VcsError, VcsService};
use crate::worker::{HandlerError, HandlerRegistry, HandlerResult, JobHandler, Worker};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    MergeGate(#[from] MergeGateError),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("task {0} already has an active cycle")]
    CycleActive(String),

    #[error("task {0} has no active cycle")]
    NoCycle(String),

    #[error("task {task_id} is in phase {actual}, expected {expected}")]
    WrongPhase {
        task_id: String,
        expected: &'static str,
        actual: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Outbound notification hook. Delivery is an external concern; the
/// default just logs.
pub trait Notifier: Send + Sync {
    fn notify(&self, task_id: &str, phase: Phase, message: &str);
}

pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, task_id: &str, phase: Phase, message: &str) {
        info!(task_id, phase = phase.as_str(), message, "cycle notification");
    }
}

pub struct Orchestrator {
    storage: Arc<Storage>,
    coordinator: Coordinator,
    ci: Arc<CiPoller>,
    gate: MergeGate,
    vcs: Arc<dyn VcsService>,
    notifier: Arc<dyn Notifier>,
    repo: RepoSection,
    merge_cfg: MergeSection,
    cfg: OrchestratorSection,
    /// Attempt budget for jobs this orchestrator enqueues.
    job_max_attempts: u32,
    /// Set after construction; the worker needs the handler registry
    /// (which needs this orchestrator) before it can exist.
    worker: OnceLock<Arc<Worker>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<Storage>,
        coordinator: Coordinator,
        ci: Arc<CiPoller>,
        vcs: Arc<dyn VcsService>,
        notifier: Arc<dyn Notifier>,
        repo: RepoSection,
        merge_cfg: MergeSection,
        cfg: OrchestratorSection,
        job_max_attempts: u32,
    ) -> Arc<Self> {
        let gate = MergeGate::new(Arc::clone(&vcs), merge_cfg.review_threshold);
        Arc::new(Self {
            storage,
            coordinator,
            ci,
            gate,
            vcs,
            notifier,
            repo,
            merge_cfg,
            cfg,
            job_max_attempts,
            worker: OnceLock::new(),
        })
    }

    /// Job handlers for the worker, one per kind.
    pub fn registry(self: &Arc<Self>) -> HandlerRegistry {
        HandlerRegistry::new(
            Arc::new(CodingJobHandler(Arc::clone(self))),
            Arc::new(FixCiJobHandler(Arc::clone(self))),
            Arc::new(FixReviewJobHandler(Arc::clone(self))),
            Arc::new(ReviewJobHandler(Arc::clone(self))),
        )
    }

    /// Attach the worker once both sides exist. Cancellation of
    /// in-flight jobs degrades to queued-only cancellation without it.
    pub fn attach_worker(&self, worker: Arc<Worker>) {
        let _ = self.worker.set(worker);
    }

    /// Begin a new cycle for a task. Rejected while a non-terminal
    /// cycle for the same task exists.
    pub async fn start_cycle(
        &self,
        task_id: &str,
        instruction: &str,
        constraints: Vec<String>,
    ) -> Result<Id> {
        let now = chrono::Utc::now();
        let state = AgenticState {
            id: Id::new(),
            task_id: task_id.to_string(),
            phase: Phase::Coding,
            iteration: 0,
            ci_iterations: 0,
            review_iterations: 0,
            pr_number: None,
            last_ci_result: None,
            last_review_result: None,
            error: None,
            started_at: now,
            updated_at: now,
        };
        match self.storage.insert_state(&state).await {
            Ok(()) => {}
            Err(StorageError::CycleActive(task)) => {
                return Err(OrchestratorError::CycleActive(task));
            }
            Err(e) => return Err(e.into()),
        }

        let payload = RunPayload {
            task_id: task_id.to_string(),
            instruction: instruction.to_string(),
            constraints,
            resume_session_id: None,
        };
        self.enqueue(JobKind::Coding, task_id, &serde_json::to_string(&payload)?)
            .await?;

        info!(task_id, state_id = %state.id, "started agentic cycle");
        Ok(state.id)
    }

    /// Approval signal for semi-automatic mode: AWAITING_HUMAN -> MERGING.
    pub async fn approve(&self, task_id: &str) -> Result<()> {
        let mut state = self.require_active(task_id).await?;
        if state.phase != Phase::AwaitingHuman {
            return Err(OrchestratorError::WrongPhase {
                task_id: task_id.to_string(),
                expected: Phase::AwaitingHuman.as_str(),
                actual: state.phase.as_str(),
            });
        }
        info!(task_id, "approval received");
        self.do_merge(&mut state).await
    }

    /// Cancel a task's cycle: stop CI polling, cancel its queued and
    /// in-flight jobs, and fail the state. Returns false when the task
    /// had no active cycle.
    pub async fn cancel(&self, task_id: &str) -> Result<bool> {
        self.ci.stop_polling(task_id);

        for kind in JobKind::ALL {
            match self.worker.get() {
                Some(worker) => {
                    worker.cancel_ref(kind, task_id).await?;
                }
                None => {
                    self.storage.cancel_jobs_by_ref(kind, task_id).await?;
                }
            }
        }

        match self.storage.active_state_for_task(task_id).await? {
            Some(mut state) => {
                self.set_failed(&mut state, "canceled").await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Route every non-terminal state left by a previous process,
    /// after the worker has force-failed orphaned running jobs.
    pub async fn recover(self: &Arc<Self>) -> Result<()> {
        let states = self.storage.list_active_states().await?;
        for mut state in states {
            match state.phase {
                p if p.runs_via_job() => {
                    // The backing job was force-failed; never presume
                    // the interrupted execution succeeded.
                    self.set_failed(&mut state, "restarted mid-execution").await?;
                }
                Phase::WaitingCi => match self.pr_ref(&state) {
                    Some(pr) => {
                        info!(task_id = %state.task_id, pr = %pr, "resuming CI polling after restart");
                        self.start_ci_polling(&state.task_id, pr);
                    }
                    None => {
                        self.set_failed(&mut state, "waiting for CI without a pull request")
                            .await?;
                    }
                },
                Phase::MergeCheck => {
                    // Read-only against the provider; safe to repeat.
                    self.run_merge_check(&mut state).await?;
                }
                Phase::Merging => {
                    self.set_failed(
                        &mut state,
                        "restarted during merge; verify the pull request manually",
                    )
                    .await?;
                }
                Phase::AwaitingHuman => {
                    // Still waiting; nothing lost across the restart.
                    debug!(task_id = %state.task_id, "cycle still awaiting approval");
                }
                _ => {}
            }
        }
        Ok(())
    }

    // --- Job-phase handling ---

    async fn handle_coding_job(
        self: &Arc<Self>,
        job: pilot_core::Job,
        cancel: CancellationToken,
    ) -> HandlerResult {
        let payload: RunPayload = parse_payload(&job.payload)?;
        let Some(mut state) = self.expect_phase(&payload.task_id, Phase::Coding).await? else {
            return Ok(());
        };

        let outcome = match self.coordinator.execute_run(&payload, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => return self.run_error(&mut state, &job, e).await,
        };

        if !outcome.pushed_commit {
            self.set_failed(&mut state, "agent produced no changes").await?;
            return Err(HandlerError::Failed("agent produced no changes".to_string()));
        }

        let pr = match state.pr_number {
            Some(number) => self.pr_for(number),
            None => {
                let title = payload
                    .instruction
                    .lines()
                    .next()
                    .unwrap_or("Automated change")
                    .to_string();
                let pr = self
                    .vcs
                    .create_pull_request(
                        &self.repo.owner,
                        &self.repo.name,
                        &outcome.workspace.branch_name,
                        &self.repo.default_branch,
                        &title,
                        &payload.instruction,
                    )
                    .await
                    .map_err(HandlerError::failed)?;
                info!(task_id = %payload.task_id, pr = %pr, "created pull request");
                state.pr_number = Some(pr.number);
                pr
            }
        };

        self.enter_waiting_ci(&mut state, pr).await?;
        Ok(())
    }

    async fn handle_fix_ci_job(
        self: &Arc<Self>,
        job: pilot_core::Job,
        cancel: CancellationToken,
    ) -> HandlerResult {
        let payload: RunPayload = parse_payload(&job.payload)?;
        let Some(mut state) = self.expect_phase(&payload.task_id, Phase::FixingCi).await? else {
            return Ok(());
        };

        let outcome = match self.coordinator.execute_run(&payload, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => return self.run_error(&mut state, &job, e).await,
        };

        if !outcome.pushed_commit {
            self.set_failed(&mut state, "CI fix produced no changes").await?;
            return Err(HandlerError::Failed("CI fix produced no changes".to_string()));
        }

        let pr = match self.pr_ref(&state) {
            Some(pr) => pr,
            None => {
                self.set_failed(&mut state, "fixing CI without a pull request").await?;
                return Err(HandlerError::Failed("missing pull request".to_string()));
            }
        };
        self.enter_waiting_ci(&mut state, pr).await?;
        Ok(())
    }

    async fn handle_fix_review_job(
        self: &Arc<Self>,
        job: pilot_core::Job,
        cancel: CancellationToken,
    ) -> HandlerResult {
        let payload: RunPayload = parse_payload(&job.payload)?;
        let Some(mut state) = self
            .expect_phase(&payload.task_id, Phase::FixingReview)
            .await?
        else {
            return Ok(());
        };

        let outcome = match self.coordinator.execute_run(&payload, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => return self.run_error(&mut state, &job, e).await,
        };

        let Some(pr) = self.pr_ref(&state) else {
            self.set_failed(&mut state, "fixing review without a pull request").await?;
            return Err(HandlerError::Failed("missing pull request".to_string()));
        };

        if outcome.pushed_commit {
            // New commit invalidates the previous CI verdict.
            self.enter_waiting_ci(&mut state, pr).await?;
        } else {
            // Nothing changed on the branch; go straight back to review.
            self.enter_reviewing(&mut state, &pr).await?;
        }
        Ok(())
    }

    async fn handle_review_job(
        self: &Arc<Self>,
        job: pilot_core::Job,
        cancel: CancellationToken,
    ) -> HandlerResult {
        let payload: ReviewPayload = parse_payload(&job.payload)?;
        let Some(mut state) = self.expect_phase(&payload.task_id, Phase::Reviewing).await? else {
            return Ok(());
        };

        let review = match self.coordinator.execute_review(&payload, cancel).await {
            Ok(review) => review,
            Err(e) => return self.run_error(&mut state, &job, e).await,
        };

        info!(
            task_id = %payload.task_id,
            score = review.score,
            threshold = self.merge_cfg.review_threshold,
            "review completed"
        );
        state.last_review_result = Some(review.clone());

        if review.score >= self.merge_cfg.review_threshold {
            state.phase = Phase::MergeCheck;
            self.persist(&mut state).await?;
            self.run_merge_check(&mut state).await.map_err(HandlerError::failed)?;
        } else {
            self.begin_review_fix(&mut state, &review).await.map_err(HandlerError::failed)?;
        }
        Ok(())
    }

    /// Shared error path for job handlers: cancellation passes through
    /// untouched (the canceling side owns the state), and a failure on
    /// the job's last attempt fails the cycle.
    async fn run_error(
        &self,
        state: &mut AgenticState,
        job: &pilot_core::Job,
        err: CoordinatorError,
    ) -> HandlerResult {
        if err.is_canceled() {
            return Err(HandlerError::Canceled);
        }
        let msg = err.to_string();
        if job.attempts >= job.max_attempts {
            self.set_failed(state, &msg).await?;
        }
        Err(HandlerError::Failed(msg))
    }

    // --- CI phase ---

    fn start_ci_polling(self: &Arc<Self>, task_id: &str, pr: PrRef) {
        let orch = Arc::clone(self);
        let task = task_id.to_string();
        self.ci.start_polling(
            task_id,
            pr,
            Box::new(move |outcome| {
                tokio::spawn(async move {
                    if let Err(e) = orch.on_ci_outcome(&task, outcome).await {
                        warn!(task_id = %task, error = %e, "CI outcome handling failed");
                    }
                });
            }),
        );
    }

    /// React to a terminal CI outcome. An outcome arriving for a task
    /// no longer waiting on CI is stale and ignored.
    pub async fn on_ci_outcome(self: &Arc<Self>, task_id: &str, outcome: CiOutcome) -> Result<()> {
        let Some(mut state) = self.storage.active_state_for_task(task_id).await? else {
            debug!(task_id, "CI outcome for task without active cycle");
            return Ok(());
        };
        if state.phase != Phase::WaitingCi {
            debug!(task_id, phase = state.phase.as_str(), "stale CI outcome ignored");
            return Ok(());
        }

        match outcome {
            CiOutcome::TimedOut => {
                self.set_failed(&mut state, "CI polling timed out").await?;
            }
            CiOutcome::Completed(result) => {
                state.last_ci_result = Some(result.clone());
                if result.success {
                    info!(task_id, "CI passed");
                    let Some(pr) = self.pr_ref(&state) else {
                        self.set_failed(&mut state, "CI passed without a pull request").await?;
                        return Ok(());
                    };
                    self.enter_reviewing(&mut state, &pr).await?;
                } else {
                    self.begin_ci_fix(&mut state, &result).await?;
                }
            }
        }
        Ok(())
    }

    async fn begin_ci_fix(&self, state: &mut AgenticState, result: &CiResult) -> Result<()> {
        if state.ci_iterations >= self.cfg.max_ci_iterations {
            let msg = format!(
                "CI still failing after {} fix attempts",
                state.ci_iterations
            );
            return self.set_failed(state, &msg).await;
        }
        if let Some(msg) = self.shared_budget_failure(state) {
            return self.set_failed(state, &msg).await;
        }

        state.ci_iterations += 1;
        state.iteration += 1;
        state.phase = Phase::FixingCi;
        self.persist(state).await?;

        let payload = RunPayload {
            task_id: state.task_id.clone(),
            instruction: build_ci_fix_instruction(result),
            constraints: Vec::new(),
            resume_session_id: None,
        };
        self.enqueue(
            JobKind::FixCi,
            &state.task_id,
            &serde_json::to_string(&payload)?,
        )
        .await?;
        info!(
            task_id = %state.task_id,
            ci_iteration = state.ci_iterations,
            "queued CI fix"
        );
        Ok(())
    }

    async fn begin_review_fix(&self, state: &mut AgenticState, review: &ReviewResult) -> Result<()> {
        if state.review_iterations >= self.cfg.max_review_iterations {
            let msg = format!(
                "review score {:.2} still below threshold after {} fix attempts",
                review.score, state.review_iterations
            );
            return self.set_failed(state, &msg).await;
        }
        if let Some(msg) = self.shared_budget_failure(state) {
            return self.set_failed(state, &msg).await;
        }

        state.review_iterations += 1;
        state.iteration += 1;
        state.phase = Phase::FixingReview;
        self.persist(state).await?;

        let payload = RunPayload {
            task_id: state.task_id.clone(),
            instruction: build_review_fix_instruction(review),
            constraints: Vec::new(),
            resume_session_id: None,
        };
        self.enqueue(
            JobKind::FixReview,
            &state.task_id,
            &serde_json::to_string(&payload)?,
        )
        .await?;
        info!(
            task_id = %state.task_id,
            review_iteration = state.review_iterations,
            "queued review fix"
        );
        Ok(())
    }

    // --- Merge phases ---

    async fn run_merge_check(&self, state: &mut AgenticState) -> Result<()> {
        let Some(pr) = self.pr_ref(state) else {
            return self.set_failed(state, "merge check without a pull request").await;
        };
        let score = state.last_review_result.as_ref().map(|r| r.score);

        let check = self.gate.check_all_conditions(&pr, score).await?;
        if !check.can_merge {
            let msg = format!("merge blocked: {}", check.failed.join(", "));
            return self.set_failed(state, &msg).await;
        }

        match self.cfg.mode {
            DriveMode::SemiAuto => {
                state.phase = Phase::AwaitingHuman;
                self.persist(state).await?;
                self.notifier.notify(
                    &state.task_id,
                    Phase::AwaitingHuman,
                    &format!("{pr} passed all merge checks and awaits approval"),
                );
                Ok(())
            }
            DriveMode::FullAuto => self.do_merge(state).await,
        }
    }

    async fn do_merge(&self, state: &mut AgenticState) -> Result<()> {
        let Some(pr) = self.pr_ref(state) else {
            return self.set_failed(state, "merging without a pull request").await;
        };
        let score = state.last_review_result.as_ref().map(|r| r.score);

        state.phase = Phase::Merging;
        self.persist(state).await?;

        match self
            .gate
            .merge(&pr, score, self.merge_cfg.method, self.merge_cfg.delete_branch)
            .await
        {
            Ok(()) => {
                state.phase = Phase::Completed;
                self.persist(state).await?;
                self.notifier
                    .notify(&state.task_id, Phase::Completed, &format!("{pr} merged"));
                Ok(())
            }
            Err(MergeGateError::Blocked(failed)) => {
                self.set_failed(state, &format!("merge blocked: {failed}")).await
            }
            Err(MergeGateError::Vcs(e)) => {
                self.set_failed(state, &format!("merge failed: {e}")).await
            }
        }
    }

    // --- Transitions & helpers ---

    async fn enter_waiting_ci(self: &Arc<Self>, state: &mut AgenticState, pr: PrRef) -> Result<()> {
        state.phase = Phase::WaitingCi;
        self.persist(state).await?;
        self.start_ci_polling(&state.task_id, pr);
        Ok(())
    }

    async fn enter_reviewing(&self, state: &mut AgenticState, pr: &PrRef) -> Result<()> {
        state.phase = Phase::Reviewing;
        self.persist(state).await?;
        let payload = ReviewPayload {
            task_id: state.task_id.clone(),
            pr_number: pr.number,
        };
        self.enqueue(
            JobKind::Review,
            &state.task_id,
            &serde_json::to_string(&payload)?,
        )
        .await?;
        Ok(())
    }

    async fn set_failed(&self, state: &mut AgenticState, error: &str) -> Result<()> {
        warn!(task_id = %state.task_id, error, "cycle failed");
        state.phase = Phase::Failed;
        state.error = Some(error.to_string());
        self.persist(state).await?;
        self.notifier.notify(&state.task_id, Phase::Failed, error);
        Ok(())
    }

    async fn persist(&self, state: &mut AgenticState) -> Result<()> {
        state.updated_at = chrono::Utc::now();
        self.storage.update_state(state).await?;
        Ok(())
    }

    /// Total-iteration and wall-clock budgets, checked before entering
    /// any fix loop.
    fn shared_budget_failure(&self, state: &AgenticState) -> Option<String> {
        if state.iteration >= self.cfg.max_total_iterations {
            return Some(format!(
                "total iteration budget of {} exhausted",
                self.cfg.max_total_iterations
            ));
        }
        let elapsed = chrono::Utc::now() - state.started_at;
        if elapsed.num_seconds() >= self.cfg.cycle_timeout_sec as i64 {
            return Some(format!(
                "cycle exceeded wall-clock budget of {}s",
                self.cfg.cycle_timeout_sec
            ));
        }
        None
    }

    async fn enqueue(&self, kind: JobKind, task_id: &str, payload: &str) -> Result<()> {
        self.storage
            .enqueue_job(
                kind,
                task_id,
                payload,
                self.job_max_attempts,
                chrono::Duration::zero(),
            )
            .await?;
        Ok(())
    }

    async fn require_active(&self, task_id: &str) -> Result<AgenticState> {
        self.storage
            .active_state_for_task(task_id)
            .await?
            .ok_or_else(|| OrchestratorError::NoCycle(task_id.to_string()))
    }

    /// Load the active state for a job, checking it is still in the
    /// phase the job belongs to. `None` means the job is moot (the
    /// cycle moved on or was canceled) and should complete as a no-op.
    async fn expect_phase(
        &self,
        task_id: &str,
        expected: Phase,
    ) -> std::result::Result<Option<AgenticState>, HandlerError> {
        let state = self
            .storage
            .active_state_for_task(task_id)
            .await
            .map_err(HandlerError::failed)?;
        match state {
            Some(state) if state.phase == expected => Ok(Some(state)),
            Some(state) => {
                warn!(
                    task_id,
                    phase = state.phase.as_str(),
                    expected = expected.as_str(),
                    "job arrived for a cycle in a different phase"
                );
                Ok(None)
            }
            None => {
                debug!(task_id, "job for task without active cycle");
                Ok(None)
            }
        }
    }

    fn pr_ref(&self, state: &AgenticState) -> Option<PrRef> {
        state.pr_number.map(|number| self.pr_for(number))
    }

    fn pr_for(&self, number: u64) -> PrRef {
        PrRef {
            owner: self.repo.owner.clone(),
            repo: self.repo.name.clone(),
            number,
        }
    }
}

impl From<StorageError> for HandlerError {
    fn from(e: StorageError) -> Self {
        HandlerError::Failed(e.to_string())
    }
}

impl From<OrchestratorError> for HandlerError {
    fn from(e: OrchestratorError) -> Self {
        HandlerError::Failed(e.to_string())
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(payload: &str) -> std::result::Result<T, HandlerError> {
    serde_json::from_str(payload)
        .map_err(|e| HandlerError::Failed(format!("malformed job payload: {e}")))
}

fn build_ci_fix_instruction(result: &CiResult) -> String {
    let mut out = String::from(
        "CI failed on the pull request branch. Fix the failing checks listed below, \
         then leave the changes uncommitted in the working tree.\n",
    );
    for job in &result.failed_jobs {
        out.push_str(&format!(
            "\n- {} ({}): {}\n",
            job.job_name,
            job.result,
            get_fix_strategy(&job.job_name)
        ));
        if let Some(log) = &job.log_excerpt {
            out.push_str(&format!("  Failure details: {log}\n"));
        }
    }
    out
}

fn build_review_fix_instruction(review: &ReviewResult) -> String {
    let mut out = format!(
        "An automated review scored the current changes {:.2}, below the required \
         threshold. Address the feedback below and improve the changes.\n",
        review.score
    );
    if let Some(summary) = &review.summary {
        out.push_str(&format!("\nReview feedback:\n{summary}\n"));
    }
    out
}

// Thin adapters giving the worker one handler object per job kind.

struct CodingJobHandler(Arc<Orchestrator>);
struct FixCiJobHandler(Arc<Orchestrator>);
struct FixReviewJobHandler(Arc<Orchestrator>);
struct ReviewJobHandler(Arc<Orchestrator>);

#[async_trait::async_trait]
impl JobHandler for CodingJobHandler {
    async fn handle(&self, job: pilot_core::Job, cancel: CancellationToken) -> HandlerResult {
        self.0.handle_coding_job(job, cancel).await
    }
}

#[async_trait::async_trait]
impl JobHandler for FixCiJobHandler {
    async fn handle(&self, job: pilot_core::Job, cancel: CancellationToken) -> HandlerResult {
        self.0.handle_fix_ci_job(job, cancel).await
    }
}

#[async_trait::async_trait]
impl JobHandler for FixReviewJobHandler {
    async fn handle(&self, job: pilot_core::Job, cancel: CancellationToken) -> HandlerResult {
        self.0.handle_fix_review_job(job, cancel).await
    }
}

#[async_trait::async_trait]
impl JobHandler for ReviewJobHandler {
    async fn handle(&self, job: pilot_core::Job, cancel: CancellationToken) -> HandlerResult {
        self.0.handle_review_job(job, cancel).await
    }
}
