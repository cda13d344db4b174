//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Default slow-task warning threshold for jobs that don't set one.
pub const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_secs(60);

/// Agent configuration.
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    /// Host (`host:port`) serving the `/api/nodes` directory.
    pub identify_host: Option<String>,
    /// Known cluster hosts. The first is used when `identify_host` is unset.
    pub hosts: Vec<String>,
    /// Master discovery settings.
    pub discovery: DiscoveryConfig,
    /// Persistent connection settings.
    pub session: SessionConfig,
    /// Failure-rate driven requeue delay settings.
    pub backpressure: BackpressureConfig,
    /// Drain-then-exit settings.
    pub shutdown: ShutdownConfig,
    /// Port for the optional status endpoint.
    pub status_port: Option<u16>,
}

/// Master discovery settings.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Delay before the very first directory lookup.
    pub initial_delay: Duration,
    /// Delay between lookups after a transport error or malformed response.
    pub retry_delay: Duration,
    /// Maximum retries after transport errors before giving up.
    pub max_retries: u32,
    /// Delay between lookups while no master is elected (retried forever).
    pub no_master_delay: Duration,
    /// Timeout for a single directory request.
    pub http_timeout: Duration,
}

/// Persistent connection settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Delay before rediscovering after a connect error or connection loss.
    pub reconnect_delay: Duration,
    /// Time allowed for a single request/acknowledgement round trip.
    pub rpc_timeout: Duration,
}

/// Requeue delay controller settings.
#[derive(Debug, Clone)]
pub struct BackpressureConfig {
    /// How often each job's delay is recomputed.
    pub tick: Duration,
    /// Width of the failure-rate window.
    pub window: Duration,
    /// Delay used before any failure is observed.
    pub initial_delay: Duration,
}

/// Drain-then-exit settings.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Hard-kill deadline after shutdown starts.
    pub timeout: Duration,
    /// How often the in-flight task count is polled.
    pub poll_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            retry_delay: Duration::from_secs(5),
            max_retries: 10,
            no_master_delay: Duration::from_secs(5),
            http_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            window: Duration::from_secs(60),
            initial_delay: Duration::from_millis(50),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl AgentConfig {
    /// Build config from `GOVERNOR_*` environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let identify_host = std::env::var("GOVERNOR_IDENTIFY_HOST")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let hosts: Vec<String> = std::env::var("GOVERNOR_HOSTS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            identify_host,
            hosts,
            discovery: DiscoveryConfig {
                initial_delay: env_millis(
                    "GOVERNOR_INITIAL_DISCOVERY_DELAY_MS",
                    defaults.discovery.initial_delay,
                ),
                retry_delay: env_millis("GOVERNOR_RETRY_DELAY_MS", defaults.discovery.retry_delay),
                max_retries: std::env::var("GOVERNOR_DISCOVERY_MAX_RETRIES")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.discovery.max_retries),
                no_master_delay: env_millis(
                    "GOVERNOR_NO_MASTER_DELAY_MS",
                    defaults.discovery.no_master_delay,
                ),
                http_timeout: env_millis("GOVERNOR_HTTP_TIMEOUT_MS", defaults.discovery.http_timeout),
            },
            session: SessionConfig {
                reconnect_delay: env_millis(
                    "GOVERNOR_RECONNECT_DELAY_MS",
                    defaults.session.reconnect_delay,
                ),
                rpc_timeout: env_millis("GOVERNOR_RPC_TIMEOUT_MS", defaults.session.rpc_timeout),
            },
            backpressure: BackpressureConfig {
                tick: env_millis("GOVERNOR_BACKPRESSURE_TICK_MS", defaults.backpressure.tick),
                ..defaults.backpressure
            },
            shutdown: ShutdownConfig {
                timeout: env_millis("GOVERNOR_SHUTDOWN_TIMEOUT_MS", defaults.shutdown.timeout),
                poll_interval: env_millis("GOVERNOR_DRAIN_POLL_MS", defaults.shutdown.poll_interval),
            },
            status_port: std::env::var("GOVERNOR_STATUS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
        }
    }

    /// The host whose `/api/nodes` directory is queried.
    pub fn directory_host(&self) -> Option<&str> {
        self.identify_host
            .as_deref()
            .or_else(|| self.hosts.first().map(String::as_str))
    }

    /// Reject configurations the agent cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.directory_host().is_none() {
            return Err(ConfigError::MissingRequired {
                key: "identify_host".into(),
                hint: "Set GOVERNOR_IDENTIFY_HOST or GOVERNOR_HOSTS".into(),
            });
        }
        if self.backpressure.tick.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "backpressure.tick".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.shutdown.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "shutdown.poll_interval".into(),
                message: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = AgentConfig::default();
        assert_eq!(config.discovery.retry_delay, Duration::from_millis(5000));
        assert_eq!(config.discovery.max_retries, 10);
        assert_eq!(config.session.reconnect_delay, Duration::from_millis(5000));
        assert_eq!(config.backpressure.tick, Duration::from_millis(1000));
        assert_eq!(config.backpressure.initial_delay, Duration::from_millis(50));
        assert_eq!(config.shutdown.timeout, Duration::from_millis(5000));
        assert_eq!(config.shutdown.poll_interval, Duration::from_millis(1000));
    }

    #[test]
    fn identify_host_wins_over_host_list() {
        let config = AgentConfig {
            identify_host: Some("directory:9000".into()),
            hosts: vec!["other:9000".into()],
            ..AgentConfig::default()
        };
        assert_eq!(config.directory_host(), Some("directory:9000"));

        let config = AgentConfig {
            hosts: vec!["first:9000".into(), "second:9000".into()],
            ..AgentConfig::default()
        };
        assert_eq!(config.directory_host(), Some("first:9000"));
    }

    #[test]
    fn validate_requires_a_directory_host() {
        let err = AgentConfig::default().validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));

        let config = AgentConfig {
            identify_host: Some("localhost:9000".into()),
            ..AgentConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
