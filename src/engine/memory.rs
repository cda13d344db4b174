//! In-process engine backed by named in-memory queues.
//!
//! Used by the binary for stand-alone runs and by tests that need a real
//! engine behind the agent. Consume options:
//! - `queue` — queue name (defaults to the injected `job_name`)
//! - `prefetch` — maximum unsettled deliveries per consumer (default 16)

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use super::{
    ConsumerControl, Engine, EngineContext, EngineEvent, EngineFactory, EventSender,
    RequeueAction, StopSignal, Task, TaskHandle, TaskHandler,
};
use crate::error::EngineError;

const DEFAULT_PREFETCH: usize = 16;
const DEFAULT_QUEUE: &str = "default";

/// A single FIFO queue plus its settlement records.
#[derive(Default)]
pub struct MemoryQueue {
    pending: Mutex<VecDeque<Task>>,
    notify: Notify,
    acked: Mutex<Vec<Task>>,
    dead_letters: Mutex<Vec<Task>>,
    requeues: AtomicUsize,
}

impl MemoryQueue {
    /// Append a task.
    pub fn push(&self, task: Task) {
        lock(&self.pending).push_back(task);
        self.notify.notify_one();
    }

    fn push_front(&self, task: Task) {
        lock(&self.pending).push_front(task);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Task> {
        lock(&self.pending).pop_front()
    }

    /// Wait for the next task.
    async fn next(&self) -> Task {
        loop {
            let notified = self.notify.notified();
            if let Some(task) = self.pop() {
                return task;
            }
            notified.await;
        }
    }

    /// Number of tasks waiting for delivery.
    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tasks acknowledged so far.
    pub fn acked(&self) -> Vec<Task> {
        lock(&self.acked).clone()
    }

    /// Tasks requeued with the `deadletter` action.
    pub fn dead_letters(&self) -> Vec<Task> {
        lock(&self.dead_letters).clone()
    }

    /// Total requeue calls, any action.
    pub fn requeue_count(&self) -> usize {
        self.requeues.load(Ordering::SeqCst)
    }
}

/// Named queues shared by every [`MemoryEngine`] built from this broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    queues: Arc<Mutex<HashMap<String, Arc<MemoryQueue>>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) a queue by name.
    pub fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        Arc::clone(lock(&self.queues).entry(name.to_string()).or_default())
    }

    /// Publish a task to a named queue.
    pub fn publish(&self, queue: &str, task: Task) {
        self.queue(queue).push(task);
    }
}

impl EngineFactory for MemoryBroker {
    fn build(&self, ctx: EngineContext) -> Result<Arc<dyn Engine>, EngineError> {
        let prefetch = match ctx.options.get("prefetch") {
            None => DEFAULT_PREFETCH,
            Some(value) => parse_prefetch(&ctx.name, value)?,
        };
        Ok(Arc::new(MemoryEngine {
            name: ctx.name,
            broker: self.clone(),
            events: ctx.events,
            prefetch,
            ready: AtomicBool::new(false),
        }))
    }
}

/// Engine delivering tasks from a [`MemoryBroker`].
pub struct MemoryEngine {
    name: String,
    broker: MemoryBroker,
    events: EventSender,
    prefetch: usize,
    ready: AtomicBool,
}

#[async_trait]
impl Engine for MemoryEngine {
    async fn setup(&self) -> Result<(), EngineError> {
        self.ready.store(true, Ordering::SeqCst);
        self.events.emit(EngineEvent::Connected);
        info!(engine = %self.name, "Memory engine ready");
        Ok(())
    }

    fn consume(
        &self,
        options: serde_json::Value,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<ConsumerControl, EngineError> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(EngineError::Consume {
                engine: self.name.clone(),
                reason: "setup() has not completed".into(),
            });
        }

        let queue_name = options
            .get("queue")
            .or_else(|| options.get("job_name"))
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_QUEUE)
            .to_string();
        let prefetch = match options.get("prefetch") {
            None => self.prefetch,
            Some(value) => parse_prefetch(&self.name, value)?,
        };

        let queue = self.broker.queue(&queue_name);
        let events = self.events.clone();
        let (control, stop) = ConsumerControl::new();

        debug!(engine = %self.name, queue = %queue_name, prefetch, "Consumer started");
        tokio::spawn(deliver(queue, handler, events, stop, prefetch, queue_name));

        Ok(control)
    }
}

async fn deliver(
    queue: Arc<MemoryQueue>,
    handler: Arc<dyn TaskHandler>,
    events: EventSender,
    mut stop: StopSignal,
    prefetch: usize,
    queue_name: String,
) {
    let permits = Arc::new(Semaphore::new(prefetch));

    loop {
        let permit = tokio::select! {
            biased;
            _ = stop.stopped() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let task = tokio::select! {
            biased;
            _ = stop.stopped() => break,
            task = queue.next() => task,
        };

        let handle = MemoryTaskHandle {
            task: task.clone(),
            queue: Arc::clone(&queue),
            events: events.clone(),
            stop: stop.clone(),
            _permit: permit,
        };
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            handler.handle(task, Box::new(handle)).await;
        });
    }

    debug!(queue = %queue_name, "Consumer stopped");
}

/// Delivery handle; holds a prefetch permit until settled.
struct MemoryTaskHandle {
    task: Task,
    queue: Arc<MemoryQueue>,
    events: EventSender,
    stop: StopSignal,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl TaskHandle for MemoryTaskHandle {
    async fn ack(self: Box<Self>) -> Result<(), EngineError> {
        let Self {
            task,
            queue,
            events,
            stop,
            ..
        } = *self;
        if stop.is_stopped() {
            events.emit(EngineEvent::OrphanedAck(task.clone()));
        }
        lock(&queue.acked).push(task);
        Ok(())
    }

    async fn requeue(self: Box<Self>, action: Option<RequeueAction>) -> Result<(), EngineError> {
        let Self {
            task,
            queue,
            events,
            stop,
            ..
        } = *self;
        if stop.is_stopped() {
            events.emit(EngineEvent::OrphanedNack(task.clone()));
        }
        queue.requeues.fetch_add(1, Ordering::SeqCst);
        match action {
            Some(RequeueAction::Deadletter) => lock(&queue.dead_letters).push(task),
            Some(RequeueAction::Tailqueue) => queue.push(task),
            Some(RequeueAction::Requeue) | None => queue.push_front(task),
        }
        Ok(())
    }
}

fn parse_prefetch(engine: &str, value: &serde_json::Value) -> Result<usize, EngineError> {
    match value.as_u64() {
        Some(n) if n > 0 => Ok(n as usize),
        _ => Err(EngineError::Consume {
            engine: engine.to_string(),
            reason: format!("prefetch must be a positive integer, got {value}"),
        }),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
