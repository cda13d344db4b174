//! Agent orchestrator — engine registry, job registry, startup, shutdown.
//!
//! Startup is strictly ordered: cluster connect + identify, then each
//! engine's `setup()` in declaration order, then every registered job is
//! activated. Jobs registered after that point activate immediately.

pub mod identity;
pub mod shutdown;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::cluster::{ClusterSession, SessionState};
use crate::config::AgentConfig;
use crate::engine::{Engine, EngineContext, EngineDefinition, EngineEvent, EngineNotice, EventSender};
use crate::error::{ClusterError, ConfigError, Error, Result};
use crate::job::{Job, JobSpec, JobStatus, PipelineContext};

pub use identity::AgentIdentity;
pub use shutdown::{
    EXIT_CLUSTER_UNREACHABLE, EXIT_ENGINE_ERROR, EXIT_GRACEFUL, InFlight, ShutdownOutcome,
};

use shutdown::Shutdown;

/// Serialisable snapshot of the agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub address: String,
    pub session: SessionState,
    pub master: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub cluster_nodes: Vec<serde_json::Value>,
    pub ready: bool,
    pub shutting_down: bool,
    pub in_flight: usize,
    pub engines: Vec<String>,
    pub jobs: Vec<JobStatus>,
}

/// One agent process.
pub struct Agent {
    config: AgentConfig,
    identity: AgentIdentity,
    session: Arc<ClusterSession>,
    /// Declaration order.
    engines: Vec<(String, Arc<dyn Engine>)>,
    jobs: RwLock<Vec<Arc<Job>>>,
    ready: AtomicBool,
    in_flight: InFlight,
    shutdown: Shutdown,
    started_at: DateTime<Utc>,
}

impl Agent {
    /// Validate config, build every declared engine and wire its events.
    /// Must be called inside a Tokio runtime.
    pub fn new(config: AgentConfig, definitions: Vec<EngineDefinition>) -> Result<Arc<Self>> {
        config.validate()?;

        let identity = AgentIdentity::generate();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        let mut engines: Vec<(String, Arc<dyn Engine>)> = Vec::with_capacity(definitions.len());
        for definition in definitions {
            if engines.iter().any(|(name, _)| *name == definition.name) {
                return Err(ConfigError::DuplicateEngine(definition.name).into());
            }
            let engine = definition.factory.build(EngineContext {
                name: definition.name.clone(),
                options: definition.options,
                events: EventSender::new(definition.name.clone(), events_tx.clone()),
            })?;
            engines.push((definition.name, engine));
        }

        let session = ClusterSession::new(&config, identity.id.clone(), fatal_tx)?;

        info!(
            agent_id = %identity.id,
            engines = engines.len(),
            directory = config.directory_host().unwrap_or_default(),
            "Agent created"
        );

        let agent = Arc::new(Self {
            shutdown: Shutdown::new(config.shutdown.clone()),
            config,
            identity,
            session,
            engines,
            jobs: RwLock::new(Vec::new()),
            ready: AtomicBool::new(false),
            in_flight: InFlight::new(),
            started_at: Utc::now(),
        });

        spawn_event_pump(Arc::downgrade(&agent), events_rx, fatal_rx);
        Ok(agent)
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<ClusterSession> {
        &self.session
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// All engines set up and registered jobs activated.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_started()
    }

    /// Register a job. Fails fast on an invalid spec, an unknown engine or a
    /// duplicate name; activates immediately if startup already finished.
    pub async fn consume(&self, spec: JobSpec) -> Result<()> {
        spec.validate()?;
        let engine = self
            .engine(&spec.source.engine)
            .ok_or_else(|| ConfigError::UnknownEngine {
                job: spec.name.clone(),
                engine: spec.source.engine.clone(),
            })?;

        let job = {
            let mut jobs = write(&self.jobs);
            if jobs.iter().any(|job| job.name() == spec.name) {
                return Err(ConfigError::DuplicateJob(spec.name).into());
            }
            let job = Arc::new(Job::new(
                spec,
                engine,
                self.pipeline_context(),
                &self.config.backpressure,
            )?);
            jobs.push(Arc::clone(&job));
            job
        };

        if self.is_ready() && !self.is_shutting_down() {
            job.activate().await?;
        }
        Ok(())
    }

    /// Connect and identify, set up engines in order, then activate jobs.
    pub async fn start(&self) -> Result<()> {
        info!(agent_id = %self.identity.id, "Starting agent");

        self.session.establish().await?;

        for (name, engine) in &self.engines {
            engine.setup().await?;
            info!(engine = %name, "Engine set up");
        }

        // Set before snapshotting so a concurrent `consume` is never missed.
        self.ready.store(true, Ordering::SeqCst);

        if self.is_shutting_down() {
            return Ok(());
        }
        let jobs = read(&self.jobs).clone();
        for job in &jobs {
            job.activate().await?;
        }

        info!(agent_id = %self.identity.id, jobs = jobs.len(), "Agent started");
        Ok(())
    }

    /// Begin drain-then-exit with `code`. Only the first call has effect.
    pub fn shutdown(&self, code: i32) -> bool {
        if !self.shutdown.trigger(code, self.in_flight.clone()) {
            return false;
        }
        for job in read(&self.jobs).iter() {
            job.stop();
        }
        true
    }

    /// Wait for shutdown to finish.
    pub async fn wait(&self) -> ShutdownOutcome {
        self.shutdown.wait().await
    }

    /// Start, then wait for shutdown. A startup failure triggers shutdown
    /// with the matching exit code.
    pub async fn run(&self) -> ShutdownOutcome {
        tokio::select! {
            result = self.start() => {
                if let Err(err) = result {
                    error!(agent_id = %self.identity.id, err = %err, "Agent failed to start");
                    self.shutdown(exit_code_for(&err));
                }
            }
            _ = self.shutdown.wait() => {}
        }

        let outcome = self.shutdown.wait().await;
        self.session.close().await;
        info!(
            agent_id = %self.identity.id,
            code = outcome.code,
            drained = outcome.drained,
            "Agent stopped"
        );
        outcome
    }

    pub async fn status(&self) -> AgentStatus {
        let jobs = read(&self.jobs).iter().map(|job| job.status()).collect();
        AgentStatus {
            agent_id: self.identity.id.clone(),
            address: self.identity.address.clone(),
            session: self.session.state(),
            master: self.session.master().await.map(|node| node.address()),
            connected_at: self.session.connected_at().await,
            started_at: self.started_at,
            cluster_nodes: self.session.cluster_nodes().await,
            ready: self.is_ready(),
            shutting_down: self.is_shutting_down(),
            in_flight: self.in_flight.count(),
            engines: self.engines.iter().map(|(name, _)| name.clone()).collect(),
            jobs,
        }
    }

    fn engine(&self, name: &str) -> Option<Arc<dyn Engine>> {
        self.engines
            .iter()
            .find(|(engine, _)| engine == name)
            .map(|(_, engine)| Arc::clone(engine))
    }

    fn pipeline_context(&self) -> PipelineContext {
        PipelineContext {
            agent_id: self.identity.id.clone(),
            rpc: Arc::clone(&self.session) as _,
            in_flight: self.in_flight.clone(),
        }
    }

    fn on_engine_event(&self, notice: EngineNotice) {
        let engine = notice.engine;
        match notice.event {
            EngineEvent::Connected => info!(engine = %engine, "Engine connected"),
            EngineEvent::Error(reason) => {
                error!(engine = %engine, err = %reason, "Engine failed");
                self.shutdown(EXIT_ENGINE_ERROR);
            }
            EngineEvent::OrphanedAck(task) => {
                warn!(engine = %engine, task = %task, "Ack for a task whose channel is gone");
            }
            EngineEvent::OrphanedNack(task) => {
                warn!(engine = %engine, task = %task, "Requeue for a task whose channel is gone");
            }
        }
    }

    fn on_cluster_fatal(&self, err: ClusterError) {
        error!(agent_id = %self.identity.id, err = %err, "Governor cluster unreachable");
        self.shutdown(EXIT_CLUSTER_UNREACHABLE);
    }
}

/// Exit code for an error that stopped startup.
pub fn exit_code_for(err: &Error) -> i32 {
    match err {
        Error::Cluster(_) => EXIT_CLUSTER_UNREACHABLE,
        Error::Engine(_) | Error::Config(_) | Error::Job(_) => EXIT_ENGINE_ERROR,
    }
}

fn spawn_event_pump(
    agent: Weak<Agent>,
    mut events: mpsc::UnboundedReceiver<EngineNotice>,
    mut fatal: mpsc::UnboundedReceiver<ClusterError>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(notice) = events.recv() => {
                    let Some(agent) = agent.upgrade() else { break };
                    agent.on_engine_event(notice);
                }
                Some(err) = fatal.recv() => {
                    let Some(agent) = agent.upgrade() else { break };
                    agent.on_cluster_fatal(err);
                }
                else => break,
            }
        }
    });
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
