//! Cluster session — the single authoritative connection to the master.
//!
//! State machine: `Disconnected → DiscoveringMaster → Connecting → Identified`.
//! Any connection loss drops back to `Disconnected` and, after the reconnect
//! delay, restarts from discovery since the old master may no longer be
//! authoritative. Exhausted discovery is reported on the fatal channel; the
//! session never keeps running headless.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot, watch};
use tracing::{error, info, warn};

use super::connection::Connection;
use super::discovery::{Discovery, NodeDescriptor};
use super::protocol::{self, HandleLocksPayload, JobEndPayload, RegisterJobPayload};
use super::{LockRequest, LockStatus, MasterRpc, RunToken};
use crate::config::{AgentConfig, SessionConfig};
use crate::error::ClusterError;

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    DiscoveringMaster,
    Connecting,
    Identified,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::DiscoveringMaster => "discovering_master",
            Self::Connecting => "connecting",
            Self::Identified => "identified",
        };
        write!(f, "{s}")
    }
}

/// Owns the connection and every reconnect decision.
pub struct ClusterSession {
    config: SessionConfig,
    discovery: Discovery,
    agent_id: String,
    state: watch::Sender<SessionState>,
    connection: RwLock<Option<Arc<Connection>>>,
    /// Serialises connect attempts so two never race.
    connect_lock: Mutex<()>,
    /// Bumped every time a connection is installed.
    generation: AtomicU64,
    master: RwLock<Option<NodeDescriptor>>,
    nodes: RwLock<Vec<Value>>,
    connected_at: RwLock<Option<DateTime<Utc>>>,
    fatal_tx: mpsc::UnboundedSender<ClusterError>,
    /// Flips to `true` once, on `close()`.
    closing: watch::Sender<bool>,
}

impl ClusterSession {
    /// Create a disconnected session. Fatal errors raised by background
    /// reconnects are sent on `fatal_tx`.
    pub fn new(
        config: &AgentConfig,
        agent_id: impl Into<String>,
        fatal_tx: mpsc::UnboundedSender<ClusterError>,
    ) -> Result<Arc<Self>, ClusterError> {
        let host = config.directory_host().ok_or(ClusterError::NoIdentifyHost)?;
        let (state, _) = watch::channel(SessionState::Disconnected);

        Ok(Arc::new(Self {
            config: config.session.clone(),
            discovery: Discovery::new(host, config.discovery.clone()),
            agent_id: agent_id.into(),
            state,
            connection: RwLock::new(None),
            connect_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            master: RwLock::new(None),
            nodes: RwLock::new(Vec::new()),
            connected_at: RwLock::new(None),
            fatal_tx,
            closing: watch::channel(false).0,
        }))
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Master the live connection points at.
    pub async fn master(&self) -> Option<NodeDescriptor> {
        self.master.read().await.clone()
    }

    /// Nodes from the last successful discovery.
    pub async fn cluster_nodes(&self) -> Vec<Value> {
        self.nodes.read().await.clone()
    }

    pub async fn connected_at(&self) -> Option<DateTime<Utc>> {
        *self.connected_at.read().await
    }

    /// Connect, then identify. Identification failures restart the cycle.
    pub async fn establish(self: &Arc<Self>) -> Result<(), ClusterError> {
        let _guard = self.connect_lock.lock().await;
        self.establish_locked().await
    }

    /// Close the connection for good. Background reconnects stop.
    pub async fn close(&self) {
        self.closing.send_replace(true);
        self.teardown().await;
        info!("Cluster session closed");
    }

    async fn establish_locked(self: &Arc<Self>) -> Result<(), ClusterError> {
        loop {
            self.connect_locked().await?;
            let identified = tokio::select! {
                result = self.identify(&self.agent_id) => result,
                _ = self.closed() => return Err(self.interrupted()),
            };
            if self.is_closing() {
                return Err(self.interrupted());
            }
            match identified {
                Ok(()) => {
                    self.state.send_replace(SessionState::Identified);
                    info!(agent_id = %self.agent_id, "Identified with governor");
                    return Ok(());
                }
                Err(err) => {
                    warn!(err = %err, "Identify failed, reconnecting");
                    self.teardown().await;
                    self.pause().await?;
                }
            }
        }
    }

    /// Connect loop. Discovery errors return; connect errors are retried
    /// after the reconnect delay. A `close()` interrupts any step.
    async fn connect_locked(self: &Arc<Self>) -> Result<(), ClusterError> {
        // At most one live connection: the old one goes before anything else.
        self.teardown().await;

        loop {
            if self.is_closing() {
                return Err(self.interrupted());
            }

            self.state.send_replace(SessionState::DiscoveringMaster);
            let discovered = tokio::select! {
                result = self.discovery.find_master() => result,
                _ = self.closed() => return Err(self.interrupted()),
            };
            let found = match discovered {
                Ok(found) => found,
                Err(err) => {
                    self.state.send_replace(SessionState::Disconnected);
                    return Err(err);
                }
            };
            *self.nodes.write().await = found.nodes;

            let node = found.master.address();
            self.state.send_replace(SessionState::Connecting);

            let opened = tokio::select! {
                result = Connection::open(&node, self.config.rpc_timeout) => result,
                _ = self.closed() => return Err(self.interrupted()),
            };
            match opened {
                Ok((connection, closed)) => {
                    let mut slot = self.connection.write().await;
                    // `close()` sets the flag before taking this lock.
                    if self.is_closing() {
                        drop(slot);
                        connection.close();
                        return Err(self.interrupted());
                    }
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    *slot = Some(Arc::new(connection));
                    drop(slot);
                    *self.master.write().await = Some(found.master);
                    *self.connected_at.write().await = Some(Utc::now());
                    info!(event = "connect", node = %node, "Connected to governor");
                    self.supervise(closed, generation, node);
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        event = "connect_error",
                        node = %node,
                        err = %err,
                        "Connection to governor erred"
                    );
                    self.state.send_replace(SessionState::Disconnected);
                    self.pause().await?;
                }
            }
        }
    }

    fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Resolves once `close()` has been called.
    async fn closed(&self) {
        let mut closing = self.closing.subscribe();
        let _ = closing.wait_for(|closing| *closing).await;
    }

    /// Sleep the reconnect delay unless the session closes first.
    async fn pause(&self) -> Result<(), ClusterError> {
        tokio::select! {
            _ = tokio::time::sleep(self.config.reconnect_delay) => Ok(()),
            _ = self.closed() => Err(self.interrupted()),
        }
    }

    /// Error for a connect attempt cut short by `close()`.
    fn interrupted(&self) -> ClusterError {
        self.state.send_replace(SessionState::Disconnected);
        ClusterError::NotConnected
    }

    /// Drop the current connection, if any.
    async fn teardown(&self) {
        let previous = self.connection.write().await.take();
        if let Some(connection) = previous {
            warn!(node = %connection.node(), "Closing existing connection");
            connection.close();
        }
        *self.connected_at.write().await = None;
        self.state.send_replace(SessionState::Disconnected);
    }

    /// Watch one connection; on an unexpected close, rediscover and reconnect.
    fn supervise(self: &Arc<Self>, closed: oneshot::Receiver<String>, generation: u64, node: String) {
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            // A dropped sender means the close was deliberate.
            let Ok(reason) = closed.await else {
                return;
            };
            let Some(session) = session.upgrade() else {
                return;
            };
            if session.is_closing() {
                return;
            }

            let _guard = session.connect_lock.lock().await;
            if session.generation.load(Ordering::SeqCst) != generation {
                // Already replaced by another connect.
                return;
            }

            warn!(event = "disconnect", node = %node, reason = %reason, "Governor connection closed");
            session.teardown().await;

            let result = match session.pause().await {
                Ok(()) => session.establish_locked().await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                if session.is_closing() {
                    return;
                }
                error!(err = %err, "Could not re-establish governor session");
                let _ = session.fatal_tx.send(err);
            }
        });
    }

    async fn call(&self, event: &str, payload: Value) -> Result<Value, ClusterError> {
        let connection = self
            .connection
            .read()
            .await
            .clone()
            .ok_or(ClusterError::NotConnected)?;
        connection.call(event, payload).await
    }
}

#[async_trait]
impl MasterRpc for ClusterSession {
    async fn identify(&self, agent_id: &str) -> Result<(), ClusterError> {
        self.call(protocol::EVENT_IDENTIFY, Value::String(agent_id.to_string()))
            .await
            .map(|_| ())
    }

    async fn register_job(&self, job_name: &str, agent_id: &str) -> Result<(), ClusterError> {
        let payload = serde_json::to_value(RegisterJobPayload {
            job_name,
            agent_name: agent_id,
        })?;
        self.call(protocol::EVENT_REGISTER_JOB, payload)
            .await
            .map(|_| ())
    }

    async fn inquire_locks(
        &self,
        locks: &[LockRequest],
        job_name: &str,
        agent_id: &str,
    ) -> Result<LockStatus, ClusterError> {
        let payload = serde_json::to_value(HandleLocksPayload {
            agent_name: agent_id,
            job_name,
            lock_data: locks,
        })?;
        let reply = self.call(protocol::EVENT_HANDLE_LOCKS, payload).await?;
        Ok(serde_json::from_value(reply)?)
    }

    async fn end_job(&self, run: &RunToken, locks: &[LockRequest]) -> Result<(), ClusterError> {
        let payload = serde_json::to_value(JobEndPayload {
            id: run,
            lock_data: locks,
        })?;
        self.call(protocol::EVENT_JOB_END, payload).await.map(|_| ())
    }
}
