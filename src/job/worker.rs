//! Worker contract — the embedding code's per-task function.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use uuid::Uuid;

use crate::cluster::RunToken;
use crate::engine::{RequeueAction, Task};

/// Processes one task. Failure drives a requeue, optionally classified.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn run(&self, task: Task, utils: WorkerUtils) -> Result<(), WorkerError>;
}

/// Adapter turning an async closure into a [`Worker`].
pub struct FnWorker<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Wrap `f` as a worker.
pub fn worker_fn<F, Fut>(f: F) -> FnWorker<F, Fut>
where
    F: Fn(Task, WorkerUtils) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), WorkerError>> + Send + 'static,
{
    FnWorker {
        f,
        _fut: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> Worker for FnWorker<F, Fut>
where
    F: Fn(Task, WorkerUtils) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), WorkerError>> + Send + 'static,
{
    async fn run(&self, task: Task, utils: WorkerUtils) -> Result<(), WorkerError> {
        (self.f)(task, utils).await
    }
}

/// Helpers handed to a worker alongside its task.
#[derive(Debug, Clone)]
pub struct WorkerUtils {
    job: String,
    run: Option<RunToken>,
    task_id: Uuid,
}

impl WorkerUtils {
    pub fn new(job: impl Into<String>, run: Option<RunToken>, task_id: Uuid) -> Self {
        Self {
            job: job.into(),
            run,
            task_id,
        }
    }

    /// Tag `err` so the task goes to the dead-letter destination.
    pub fn deadletter(&self, err: impl Into<anyhow::Error>) -> WorkerError {
        WorkerError::deadletter(err)
    }

    /// Tag `err` so the task goes to the back of its queue.
    pub fn tailqueue(&self, err: impl Into<anyhow::Error>) -> WorkerError {
        WorkerError::tailqueue(err)
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    /// Job-run token from the lock inquiry; `None` when the job takes no locks.
    pub fn run(&self) -> Option<&RunToken> {
        self.run.as_ref()
    }

    /// Log correlation id for this task.
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }
}

/// A worker failure, optionally tagged with how the task should be requeued.
#[derive(Debug)]
pub struct WorkerError {
    tag: Option<RequeueAction>,
    inner: anyhow::Error,
}

impl WorkerError {
    /// Untagged failure; the task is requeued with the `requeue` action.
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self {
            tag: None,
            inner: err.into(),
        }
    }

    pub fn deadletter(err: impl Into<anyhow::Error>) -> Self {
        Self {
            tag: Some(RequeueAction::Deadletter),
            inner: err.into(),
        }
    }

    pub fn tailqueue(err: impl Into<anyhow::Error>) -> Self {
        Self {
            tag: Some(RequeueAction::Tailqueue),
            inner: err.into(),
        }
    }

    pub fn tag(&self) -> Option<RequeueAction> {
        self.tag
    }

    /// The requeue action this failure maps to.
    pub fn requeue_action(&self) -> RequeueAction {
        self.tag.unwrap_or(RequeueAction::Requeue)
    }
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#}", self.inner)
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for WorkerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err)
    }
}
