//! Per-task pipeline: locks → inquiry → worker → ack / requeue → job end.
//!
//! Every task ends in exactly one settlement (ack or requeue). When the
//! master granted a job-run token, exactly one `end_job` follows on both the
//! success and failure paths. When the inquiry itself fails there is no token
//! and nothing is released; the master's own expiry reclaims any reservation.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backpressure::DelayController;
use super::locks::LockKeys;
use super::worker::{Worker, WorkerError, WorkerUtils};
use super::{InquirePolicy, JobSpec};
use crate::agent::shutdown::InFlight;
use crate::cluster::{LockRequest, MasterRpc, RunToken};
use crate::config::DEFAULT_SLOW_THRESHOLD;
use crate::engine::{RequeueAction, Task, TaskHandle, TaskHandler};
use crate::error::JobError;

/// Delays at or below this are not worth a timer.
const MIN_REQUEUE_DELAY: Duration = Duration::from_millis(1);

/// State of one task inside the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting on lock computation and the master's inquiry answer.
    LockPending,
    /// Worker is executing.
    Running,
    /// Worker succeeded and the task was acknowledged.
    Completed,
    /// Master refused the lock set; the task was requeued untouched.
    Rejected,
    /// Worker or pre-work step failed; the task was requeued.
    Failed,
}

impl TaskState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, target),
            (LockPending, Running)
                | (LockPending, Rejected)
                | (LockPending, Failed)
                | (Running, Completed)
                | (Running, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Failed)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::LockPending => "lock_pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Result of one pipeline execution.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub state: TaskState,
    pub run: Option<RunToken>,
}

/// Terminal-state tallies for one job.
#[derive(Debug, Default)]
pub struct TaskCounters {
    completed: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`TaskCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub completed: u64,
    pub rejected: u64,
    pub failed: u64,
}

impl TaskCounters {
    fn record(&self, state: TaskState) {
        let counter = match state {
            TaskState::Completed => &self.completed,
            TaskState::Rejected => &self.rejected,
            TaskState::Failed => &self.failed,
            TaskState::LockPending | TaskState::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TaskCounts {
        TaskCounts {
            completed: self.completed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Shared agent-side pieces every pipeline needs.
#[derive(Clone)]
pub struct PipelineContext {
    pub agent_id: String,
    pub rpc: Arc<dyn MasterRpc>,
    pub in_flight: InFlight,
}

/// The [`TaskHandler`] a job registers with its engine.
pub struct TaskPipeline {
    job: String,
    inquire: InquirePolicy,
    worker: Arc<dyn Worker>,
    slow_threshold: Duration,
    ctx: PipelineContext,
    delay: Arc<DelayController>,
    counters: Arc<TaskCounters>,
}

impl TaskPipeline {
    pub fn new(spec: &JobSpec, ctx: PipelineContext, delay: Arc<DelayController>) -> Self {
        Self {
            job: spec.name.clone(),
            inquire: spec.inquire.clone(),
            worker: Arc::clone(&spec.worker),
            slow_threshold: spec.slow_threshold.unwrap_or(DEFAULT_SLOW_THRESHOLD),
            ctx,
            delay,
            counters: Arc::new(TaskCounters::default()),
        }
    }

    pub fn counters(&self) -> &Arc<TaskCounters> {
        &self.counters
    }

    /// Run one task through every step and settle it.
    pub async fn process(&self, task: Task, handle: Box<dyn TaskHandle>) -> TaskOutcome {
        let _in_flight = self.ctx.in_flight.enter();
        let task_id = Uuid::new_v4();
        let mut state = TaskState::LockPending;

        let locks = match self.lock_set(&task) {
            Ok(locks) => locks,
            Err(err) => {
                error!(job = %self.job, task_id = %task_id, err = %err, "Lock key computation failed");
                self.requeue(handle, None, task_id).await;
                return self.finish(task_id, &mut state, TaskState::Failed, None);
            }
        };

        let run = match &locks {
            None => None,
            Some(locks) => {
                match self
                    .ctx
                    .rpc
                    .inquire_locks(locks, &self.job, &self.ctx.agent_id)
                    .await
                {
                    Ok(status) if status.ok => Some(status.id),
                    Ok(_) => {
                        debug!(job = %self.job, task_id = %task_id, locks = ?locks, "Locks not granted");
                        self.requeue(handle, None, task_id).await;
                        return self.finish(task_id, &mut state, TaskState::Rejected, None);
                    }
                    Err(source) => {
                        let err = JobError::Inquiry {
                            job: self.job.clone(),
                            source,
                        };
                        error!(job = %self.job, task_id = %task_id, locks = ?locks, err = %err, "Lock inquiry failed");
                        self.requeue(handle, None, task_id).await;
                        return self.finish(task_id, &mut state, TaskState::Failed, None);
                    }
                }
            }
        };
        let locks = locks.unwrap_or_default();

        advance(&self.job, task_id, &mut state, TaskState::Running);
        let utils = WorkerUtils::new(self.job.clone(), run.clone(), task_id);

        match self.run_worker(task, utils, task_id, run.as_ref()).await {
            Ok(()) => {
                if let Err(err) = handle.ack().await {
                    error!(job = %self.job, task_id = %task_id, err = %err, "Acknowledge failed");
                }
                self.end_job(run.as_ref(), &locks, task_id).await;
                self.finish(task_id, &mut state, TaskState::Completed, run)
            }
            Err(err) => {
                let action = err.requeue_action();
                tokio::join!(
                    self.requeue(handle, Some(action), task_id),
                    self.end_job(run.as_ref(), &locks, task_id),
                );
                error!(
                    job = %self.job,
                    task_id = %task_id,
                    run_id = %display_run(run.as_ref()),
                    locks = ?locks,
                    action = %action,
                    err = %err,
                    "Job failed"
                );
                self.finish(task_id, &mut state, TaskState::Failed, run)
            }
        }
    }

    /// `None` when the job takes no locks (inquiry is skipped).
    fn lock_set(&self, task: &Task) -> Result<Option<Vec<LockRequest>>, JobError> {
        match &self.inquire {
            InquirePolicy::None => Ok(None),
            InquirePolicy::Raw(f) => Ok(Some(f(task))),
            InquirePolicy::Keyed { locking, key } => LockKeys::try_from(key(task))
                .map(|keys| Some(keys.into_requests(*locking)))
                .map_err(|found| JobError::InvalidLockKeys {
                    job: self.job.clone(),
                    found,
                }),
        }
    }

    /// Run the worker, warning once if it outlives the slow threshold.
    async fn run_worker(
        &self,
        task: Task,
        utils: WorkerUtils,
        task_id: Uuid,
        run: Option<&RunToken>,
    ) -> Result<(), WorkerError> {
        let work = AssertUnwindSafe(self.worker.run(task, utils)).catch_unwind();
        tokio::pin!(work);
        let watchdog = tokio::time::sleep(self.slow_threshold);
        tokio::pin!(watchdog);

        let result = tokio::select! {
            result = &mut work => result,
            _ = &mut watchdog => {
                warn!(
                    job = %self.job,
                    task_id = %task_id,
                    run_id = %display_run(run),
                    threshold_ms = self.slow_threshold.as_millis() as u64,
                    "Job is slow"
                );
                work.await
            }
        };

        result.unwrap_or_else(|panic| {
            Err(WorkerError::new(anyhow!(
                "worker panicked: {}",
                panic_message(panic.as_ref())
            )))
        })
    }

    /// Record a failure, wait out the job's current delay, then requeue.
    async fn requeue(&self, handle: Box<dyn TaskHandle>, action: Option<RequeueAction>, task_id: Uuid) {
        self.delay.record_failure();
        let delay = self.delay.current_delay();
        if delay > MIN_REQUEUE_DELAY {
            tokio::time::sleep(delay).await;
        }
        if let Err(err) = handle.requeue(action).await {
            error!(job = %self.job, task_id = %task_id, err = %err, "Requeue failed");
        }
    }

    async fn end_job(&self, run: Option<&RunToken>, locks: &[LockRequest], task_id: Uuid) {
        let Some(run) = run else {
            return;
        };
        if let Err(err) = self.ctx.rpc.end_job(run, locks).await {
            error!(
                job = %self.job,
                task_id = %task_id,
                run_id = %run,
                locks = ?locks,
                err = %err,
                "Failed to end job run"
            );
        }
    }

    fn finish(
        &self,
        task_id: Uuid,
        state: &mut TaskState,
        next: TaskState,
        run: Option<RunToken>,
    ) -> TaskOutcome {
        advance(&self.job, task_id, state, next);
        self.counters.record(next);
        if next == TaskState::Completed {
            info!(job = %self.job, task_id = %task_id, run_id = %display_run(run.as_ref()), "Task completed");
        }
        TaskOutcome {
            task_id,
            state: next,
            run,
        }
    }
}

#[async_trait]
impl TaskHandler for TaskPipeline {
    async fn handle(&self, task: Task, handle: Box<dyn TaskHandle>) {
        self.process(task, handle).await;
    }
}

fn advance(job: &str, task_id: Uuid, state: &mut TaskState, next: TaskState) {
    if !state.can_transition_to(next) {
        warn!(job = %job, task_id = %task_id, from = %state, to = %next, "Unexpected task transition");
    }
    *state = next;
}

fn display_run(run: Option<&RunToken>) -> String {
    run.map(ToString::to_string).unwrap_or_else(|| "-".into())
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
