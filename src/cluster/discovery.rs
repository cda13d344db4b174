//! Master discovery via the cluster's `/api/nodes` directory.
//!
//! Two retry classes with different patience:
//! - transport errors and malformed responses are retried at a fixed delay,
//!   at most `max_retries` times, then surface as fatal;
//! - a valid response with no master is retried forever, since "no master
//!   elected yet" is an expected transient state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::DiscoveryConfig;
use crate::error::ClusterError;

/// The master node as listed by the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub hostname: String,
    #[serde(deserialize_with = "port_from_number_or_string")]
    pub port: u16,
    #[serde(default)]
    pub master: bool,
    /// Anything else the directory reports.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl NodeDescriptor {
    /// `hostname:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// Directories report ports either as numbers or as numeric strings.
fn port_from_number_or_string<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid port {text:?}"))),
    }
}

/// Result of a successful discovery round.
#[derive(Debug, Clone)]
pub struct DiscoveredMaster {
    pub master: NodeDescriptor,
    /// Every node the directory listed, as reported.
    pub nodes: Vec<Value>,
}

/// Directory client with the retry policy baked in.
pub struct Discovery {
    client: reqwest::Client,
    host: String,
    config: DiscoveryConfig,
}

impl Discovery {
    pub fn new(host: impl Into<String>, config: DiscoveryConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            host: host.into(),
            config,
        }
    }

    pub fn nodes_url(&self) -> String {
        format!("http://{}/api/nodes", self.host)
    }

    /// Locate the current master, retrying per the policy above.
    pub async fn find_master(&self) -> Result<DiscoveredMaster, ClusterError> {
        let mut failures: u32 = 0;
        let mut delay = self.config.initial_delay;

        loop {
            tokio::time::sleep(delay).await;

            let round = self.fetch_nodes().await.and_then(|nodes| {
                let master = select_master(&nodes).map_err(|reason| self.error(reason))?;
                Ok((master, nodes))
            });

            let (master, nodes) = match round {
                Ok(found) => found,
                Err(err) => {
                    failures += 1;
                    if failures > self.config.max_retries {
                        return Err(ClusterError::DiscoveryExhausted {
                            host: self.host.clone(),
                            attempts: failures,
                        });
                    }
                    warn!(
                        host = %self.host,
                        attempt = failures,
                        max_retries = self.config.max_retries,
                        err = %err,
                        "Node discovery failed, retrying"
                    );
                    delay = self.config.retry_delay;
                    continue;
                }
            };

            failures = 0;
            match master {
                Some(master) => {
                    debug!(host = %self.host, master = %master.address(), "Master located");
                    return Ok(DiscoveredMaster { master, nodes });
                }
                None => {
                    warn!(
                        host = %self.host,
                        delay_ms = self.config.no_master_delay.as_millis() as u64,
                        "No masters found, waiting to retry"
                    );
                    delay = self.config.no_master_delay;
                }
            }
        }
    }

    /// One directory lookup, no retries.
    pub async fn fetch_nodes(&self) -> Result<Vec<Value>, ClusterError> {
        let response = self
            .client
            .get(self.nodes_url())
            .timeout(self.config.http_timeout)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| self.error(e.to_string()))?;

        let payload: Value = response.json().await.map_err(|e| self.error(e.to_string()))?;
        parse_nodes(payload).map_err(|reason| self.error(reason))
    }

    fn error(&self, reason: String) -> ClusterError {
        ClusterError::Discovery {
            host: self.host.clone(),
            reason,
        }
    }
}

/// Validate a directory payload: a non-empty array. Entries are not
/// inspected here; only the chosen master has to be well formed.
pub fn parse_nodes(payload: Value) -> Result<Vec<Value>, String> {
    match payload {
        Value::Array(items) if !items.is_empty() => Ok(items),
        other => Err(format!("Invalid response: {other}")),
    }
}

/// First node flagged `master: true`, parsed. `Ok(None)` when no node is.
pub fn select_master(nodes: &[Value]) -> Result<Option<NodeDescriptor>, String> {
    let Some(entry) = nodes
        .iter()
        .find(|node| node.get("master").and_then(Value::as_bool) == Some(true))
    else {
        return Ok(None);
    };
    serde_json::from_value(entry.clone())
        .map(Some)
        .map_err(|e| format!("Invalid master entry {entry}: {e}"))
}
