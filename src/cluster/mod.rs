//! Cluster session — discovery of, and RPC with, the governor master.
//!
//! Core components:
//! - `discovery` — `/api/nodes` lookup and master selection
//! - `protocol` — JSON call/ack frames and event payloads
//! - `connection` — one persistent WebSocket with an ack table
//! - `session` — owns the single live connection and all reconnect logic

pub mod connection;
pub mod discovery;
pub mod protocol;
pub mod session;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

pub use discovery::{Discovery, NodeDescriptor};
pub use session::{ClusterSession, SessionState};

/// One entry of a lock set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockRequest {
    pub key: String,
    pub locking: bool,
}

impl LockRequest {
    pub fn new(key: impl Into<String>, locking: bool) -> Self {
        Self {
            key: key.into(),
            locking,
        }
    }
}

/// Opaque job-run token handed out by the master on a granted inquiry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunToken(pub serde_json::Value);

impl std::fmt::Display for RunToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            serde_json::Value::String(s) => write!(f, "{s}"),
            other => write!(f, "{other}"),
        }
    }
}

impl From<&str> for RunToken {
    fn from(s: &str) -> Self {
        Self(serde_json::Value::String(s.to_string()))
    }
}

/// Master's answer to a lock inquiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockStatus {
    /// `false` when any requested lock is held by a conflicting holder.
    pub ok: bool,
    #[serde(default)]
    pub id: RunToken,
}

/// The four calls the agent makes against the master.
#[async_trait]
pub trait MasterRpc: Send + Sync {
    /// Register this agent. Sent once per connection.
    async fn identify(&self, agent_id: &str) -> Result<(), ClusterError>;

    /// Tell the master a job exists on this agent.
    async fn register_job(&self, job_name: &str, agent_id: &str) -> Result<(), ClusterError>;

    /// Request a lock set for one task.
    async fn inquire_locks(
        &self,
        locks: &[LockRequest],
        job_name: &str,
        agent_id: &str,
    ) -> Result<LockStatus, ClusterError>;

    /// Release the locks held under `run`.
    async fn end_job(&self, run: &RunToken, locks: &[LockRequest]) -> Result<(), ClusterError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lock_status_parses_opaque_ids() {
        let status: LockStatus = serde_json::from_value(json!({"ok": true, "id": 42})).unwrap();
        assert!(status.ok);
        assert_eq!(status.id, RunToken(json!(42)));
        assert_eq!(status.id.to_string(), "42");

        let status: LockStatus = serde_json::from_value(json!({"ok": false})).unwrap();
        assert!(!status.ok);
        assert_eq!(status.id, RunToken::default());
    }

    #[test]
    fn run_token_displays_strings_bare() {
        assert_eq!(RunToken::from("X").to_string(), "X");
    }
}
