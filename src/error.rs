//! Error types for the governor agent.

use std::time::Duration;

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors. Raised synchronously at construction or
/// registration time.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Engine {engine} must already be registered (job {job})")]
    UnknownEngine { job: String, engine: String },

    #[error("Engine {0} is declared more than once")]
    DuplicateEngine(String),

    #[error("Job {0} is already registered")]
    DuplicateJob(String),
}

/// Errors talking to the cluster master.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("No identify host configured")]
    NoIdentifyHost,

    #[error("Node discovery via {host} failed: {reason}")]
    Discovery { host: String, reason: String },

    #[error("Node discovery via {host} gave up after {attempts} attempts")]
    DiscoveryExhausted { host: String, attempts: u32 },

    #[error("Connection to {node} failed: {reason}")]
    Connect { node: String, reason: String },

    #[error("Not connected to a master")]
    NotConnected,

    #[error("Connection to master closed")]
    Disconnected,

    #[error("Master rejected {event}: {message}")]
    Remote { event: String, message: String },

    #[error("{event} timed out after {timeout:?}")]
    Timeout { event: String, timeout: Duration },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClusterError {
    /// Whether this error must take the whole agent down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DiscoveryExhausted { .. } | Self::NoIdentifyHost)
    }
}

/// Engine adapter errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Engine {engine} setup failed: {reason}")]
    Setup { engine: String, reason: String },

    #[error("Engine {engine} could not start consuming: {reason}")]
    Consume { engine: String, reason: String },
}

/// Per-task pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Invalid response from locking key generation for job {job}: got {found}")]
    InvalidLockKeys { job: String, found: String },

    #[error("Lock inquiry for job {job} failed: {source}")]
    Inquiry {
        job: String,
        #[source]
        source: ClusterError,
    },
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;
