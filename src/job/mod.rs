//! Jobs — registration, lock policy, and engine attachment.
//!
//! A [`JobSpec`] is what embedding code hands to the agent. Once validated
//! against the engine registry it becomes a [`Job`], which owns the job's
//! backpressure controller and attaches a [`TaskPipeline`] to its engine
//! when activated.

pub mod backpressure;
pub mod locks;
pub mod pipeline;
pub mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cluster::LockRequest;
use crate::config::{BackpressureConfig, DEFAULT_SLOW_THRESHOLD};
use crate::engine::{ConsumerControl, Engine, Task};
use crate::error::{ConfigError, EngineError};

pub use backpressure::DelayController;
pub use locks::LockKeys;
pub use pipeline::{PipelineContext, TaskCounts, TaskOutcome, TaskPipeline, TaskState};
pub use worker::{FnWorker, Worker, WorkerError, WorkerUtils, worker_fn};

/// Derives lock keys from a task. Must return a string or array of strings.
pub type KeyFn = Arc<dyn Fn(&Task) -> Value + Send + Sync>;

/// Computes the full lock set for a task.
pub type RawLockFn = Arc<dyn Fn(&Task) -> Vec<LockRequest> + Send + Sync>;

/// How a job's tasks coordinate through the master.
#[derive(Clone, Default)]
pub enum InquirePolicy {
    /// No coordination; tasks run fully concurrently and never inquire.
    #[default]
    None,
    /// Every key from `key` is requested with the same `locking` flag.
    Keyed { locking: bool, key: KeyFn },
    /// The caller builds the lock set.
    Raw(RawLockFn),
}

impl InquirePolicy {
    pub fn keyed<F>(locking: bool, key: F) -> Self
    where
        F: Fn(&Task) -> Value + Send + Sync + 'static,
    {
        Self::Keyed {
            locking,
            key: Arc::new(key),
        }
    }

    pub fn raw<F>(f: F) -> Self
    where
        F: Fn(&Task) -> Vec<LockRequest> + Send + Sync + 'static,
    {
        Self::Raw(Arc::new(f))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Keyed { .. } => "keyed",
            Self::Raw(_) => "raw",
        }
    }
}

impl std::fmt::Debug for InquirePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Keyed { locking, .. } => f
                .debug_struct("Keyed")
                .field("locking", locking)
                .finish_non_exhaustive(),
            Self::Raw(_) => write!(f, "Raw(..)"),
        }
    }
}

/// Where a job's tasks come from.
#[derive(Debug, Clone)]
pub struct JobSource {
    /// Name of a registered engine.
    pub engine: String,
    /// Engine-specific consume options. Must be an object (or null).
    pub options: Value,
}

/// Registration input for one job.
#[derive(Clone)]
pub struct JobSpec {
    pub name: String,
    pub source: JobSource,
    pub inquire: InquirePolicy,
    pub worker: Arc<dyn Worker>,
    /// Watchdog threshold. Defaults to 60 seconds.
    pub slow_threshold: Option<Duration>,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, engine: impl Into<String>, worker: impl Worker + 'static) -> Self {
        Self {
            name: name.into(),
            source: JobSource {
                engine: engine.into(),
                options: Value::Null,
            },
            inquire: InquirePolicy::None,
            worker: Arc::new(worker),
            slow_threshold: None,
        }
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.source.options = options;
        self
    }

    pub fn with_inquire(mut self, inquire: InquirePolicy) -> Self {
        self.inquire = inquire;
        self
    }

    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = Some(threshold);
        self
    }

    /// Check everything that doesn't need the engine registry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "name".into(),
                hint: "Every job needs a unique name".into(),
            });
        }
        if self.source.engine.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: format!("{}.source.engine", self.name),
                hint: "Name the engine the job consumes from".into(),
            });
        }
        if !(self.source.options.is_object() || self.source.options.is_null()) {
            return Err(ConfigError::InvalidValue {
                key: format!("{}.source.options", self.name),
                message: "must be an object".into(),
            });
        }
        if self.slow_threshold.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::InvalidValue {
                key: format!("{}.slow_threshold", self.name),
                message: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Consume options with the job name injected as `job_name`.
    pub fn consume_options(&self) -> Value {
        let mut options = match &self.source.options {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        options.insert("job_name".into(), Value::String(self.name.clone()));
        Value::Object(options)
    }
}

impl std::fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSpec")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("inquire", &self.inquire)
            .field("slow_threshold", &self.slow_threshold)
            .finish_non_exhaustive()
    }
}

/// Serialisable view of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub engine: String,
    pub inquire: &'static str,
    pub active: bool,
    pub requeue_delay_ms: u64,
    pub failure_rate: f64,
    pub tasks: TaskCounts,
}

/// A registered job.
pub struct Job {
    name: String,
    engine_name: String,
    engine: Arc<dyn Engine>,
    options: Value,
    inquire_kind: &'static str,
    pipeline: Arc<TaskPipeline>,
    delay: Arc<DelayController>,
    ctx: PipelineContext,
    consumer: Mutex<Option<ConsumerControl>>,
    active: AtomicBool,
    stopped: AtomicBool,
    monitor: JoinHandle<()>,
}

impl Job {
    /// Build a job bound to `engine`. Must be called inside a runtime: the
    /// backpressure monitor starts immediately.
    pub fn new(
        spec: JobSpec,
        engine: Arc<dyn Engine>,
        ctx: PipelineContext,
        backpressure: &BackpressureConfig,
    ) -> Result<Self, ConfigError> {
        spec.validate()?;

        let delay = Arc::new(DelayController::new(
            spec.name.clone(),
            backpressure.window,
            backpressure.initial_delay,
        ));
        let monitor = backpressure::spawn_monitor(&delay, backpressure.tick);
        let pipeline = Arc::new(TaskPipeline::new(&spec, ctx.clone(), Arc::clone(&delay)));

        info!(
            job = %spec.name,
            engine = %spec.source.engine,
            inquire = spec.inquire.kind(),
            slow_threshold_ms = spec.slow_threshold.unwrap_or(DEFAULT_SLOW_THRESHOLD).as_millis() as u64,
            "Job registered"
        );

        Ok(Self {
            options: spec.consume_options(),
            inquire_kind: spec.inquire.kind(),
            name: spec.name,
            engine_name: spec.source.engine,
            engine,
            pipeline,
            delay,
            ctx,
            consumer: Mutex::new(None),
            active: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            monitor,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn delay(&self) -> &Arc<DelayController> {
        &self.delay
    }

    /// Announce the job to the master, then attach the pipeline to the
    /// engine. Only the first call has effect.
    pub async fn activate(&self) -> Result<(), EngineError> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(err) = self
            .ctx
            .rpc
            .register_job(&self.name, &self.ctx.agent_id)
            .await
        {
            warn!(job = %self.name, err = %err, "Could not register job with governor");
        }

        let control = match self
            .engine
            .consume(self.options.clone(), Arc::clone(&self.pipeline) as _)
        {
            Ok(control) => control,
            Err(err) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        let mut consumer = lock(&self.consumer);
        if self.stopped.load(Ordering::SeqCst) {
            // Stopped while registering.
            control.stop();
        }
        *consumer = Some(control);
        drop(consumer);
        info!(job = %self.name, engine = %self.engine_name, "Job consuming");
        Ok(())
    }

    /// Stop delivery of new tasks. In-flight tasks finish normally.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(control) = lock(&self.consumer).as_ref() {
            control.stop();
        }
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            name: self.name.clone(),
            engine: self.engine_name.clone(),
            inquire: self.inquire_kind,
            active: self.is_active(),
            requeue_delay_ms: self.delay.current_delay().as_millis() as u64,
            failure_rate: self.delay.failure_rate(),
            tasks: self.pipeline.counters().snapshot(),
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        self.monitor.abort();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
