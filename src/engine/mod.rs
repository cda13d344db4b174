//! Engine adapter contract — the pluggable work-queue side of the agent.
//!
//! An engine is built once per declared name by its [`EngineFactory`], set up
//! once during startup, and then asked to `consume` on behalf of each job.
//! Lifecycle signals flow back to the agent through an [`EventSender`]
//! instead of callbacks, and each delivered task carries a [`TaskHandle`]
//! whose two verbs (ack / requeue) consume it, so a task is settled at most
//! once.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::error::EngineError;

pub use memory::{MemoryBroker, MemoryEngine};

/// A task payload as delivered by an engine.
pub type Task = serde_json::Value;

/// How a failed task should be requeued. Interpreted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequeueAction {
    Requeue,
    Deadletter,
    Tailqueue,
}

impl std::fmt::Display for RequeueAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Requeue => "requeue",
            Self::Deadletter => "deadletter",
            Self::Tailqueue => "tailqueue",
        };
        write!(f, "{s}")
    }
}

/// Settles one delivered task. Both verbs consume the handle.
#[async_trait]
pub trait TaskHandle: Send {
    /// Acknowledge successful processing.
    async fn ack(self: Box<Self>) -> Result<(), EngineError>;

    /// Hand the task back to the engine. `None` is the unclassified default.
    async fn requeue(self: Box<Self>, action: Option<RequeueAction>) -> Result<(), EngineError>;
}

/// Receives tasks from an engine. One handler per consuming job.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: Task, handle: Box<dyn TaskHandle>);
}

/// A concrete work-queue adapter.
#[async_trait]
pub trait Engine: Send + Sync {
    /// One-time preparation (connections, topology). Called in declaration order.
    async fn setup(&self) -> Result<(), EngineError>;

    /// Start delivering tasks matching `options` to `handler`.
    fn consume(
        &self,
        options: serde_json::Value,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<ConsumerControl, EngineError>;
}

/// Builds an engine instance from its declaration.
pub trait EngineFactory: Send + Sync {
    fn build(&self, ctx: EngineContext) -> Result<Arc<dyn Engine>, EngineError>;
}

/// Everything an engine receives at construction.
pub struct EngineContext {
    /// Name the engine is registered under.
    pub name: String,
    /// Engine-specific options from the declaration.
    pub options: serde_json::Value,
    /// Channel for lifecycle events.
    pub events: EventSender,
}

/// One entry of the agent's engine list.
#[derive(Clone)]
pub struct EngineDefinition {
    pub name: String,
    pub factory: Arc<dyn EngineFactory>,
    pub options: serde_json::Value,
}

impl EngineDefinition {
    pub fn new(name: impl Into<String>, factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            name: name.into(),
            factory,
            options: serde_json::Value::Null,
        }
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }
}

impl std::fmt::Debug for EngineDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineDefinition")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

// ── Events ──────────────────────────────────────────────────────────────

/// Lifecycle signals an engine reports to the agent.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The engine reached its backend.
    Connected,
    /// Unrecoverable failure; the agent shuts down.
    Error(String),
    /// An ack arrived for a task whose delivery channel is gone.
    OrphanedAck(Task),
    /// A requeue arrived for a task whose delivery channel is gone.
    OrphanedNack(Task),
}

/// An event tagged with the engine that raised it.
#[derive(Debug, Clone)]
pub struct EngineNotice {
    pub engine: String,
    pub event: EngineEvent,
}

/// Cloneable sender handed to each engine.
#[derive(Debug, Clone)]
pub struct EventSender {
    engine: String,
    tx: mpsc::UnboundedSender<EngineNotice>,
}

impl EventSender {
    pub fn new(engine: impl Into<String>, tx: mpsc::UnboundedSender<EngineNotice>) -> Self {
        Self {
            engine: engine.into(),
            tx,
        }
    }

    /// Emit an event. Ignored once the agent stops listening.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(EngineNotice {
            engine: self.engine.clone(),
            event,
        });
    }
}

// ── Consumer control ────────────────────────────────────────────────────

/// Returned by [`Engine::consume`]; stops delivery for one job.
#[derive(Debug)]
pub struct ConsumerControl {
    stop: watch::Sender<bool>,
}

/// Engine-side view of a [`ConsumerControl`].
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl ConsumerControl {
    pub fn new() -> (Self, StopSignal) {
        let (stop, rx) = watch::channel(false);
        (Self { stop }, StopSignal { rx })
    }

    /// Stop delivering new tasks. Tasks already delivered are unaffected.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the consumer has been stopped (or its control dropped).
    pub async fn stopped(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}
