//! Routing layer configuration.
//!
//! Configuration is loaded from environment variables. The Redis URL is
//! redacted in Debug output. When no Redis URL is configured the router runs
//! in single-process mode.

use crate::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default heartbeat interval in seconds.
pub const DEFAULT_REFRESH_INTERVAL_SECONDS: u64 = 3;

/// Default node record expiry in seconds. Must exceed the refresh interval
/// with margin; readers judge liveness by record age against this value.
pub const DEFAULT_EXPIRE_AFTER_SECONDS: u64 = 10;

/// Default RTC-side pipe idle timeout in seconds.
pub const DEFAULT_IDLE_TIMEOUT_SECONDS: u64 = 10;

/// Default per-direction pipe buffer capacity in messages.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 200;

/// Default grace window for draining pipes on shutdown, in milliseconds.
pub const DEFAULT_DRAIN_GRACE_MILLIS: u64 = 1_000;

/// Default deadline for individual store and fabric operations, in seconds.
pub const DEFAULT_OPERATION_TIMEOUT_SECONDS: u64 = 5;

/// Default node ID prefix.
pub const DEFAULT_NODE_ID_PREFIX: &str = "nd";

/// Routing layer configuration.
///
/// Loaded from environment variables with sensible defaults. The Redis URL
/// is redacted in Debug output.
#[derive(Clone)]
pub struct RouterConfig {
    /// Unique identifier for this node. Auto-generated when unset.
    pub node_id: String,

    /// Address other nodes can reach this node on.
    pub node_ip: String,

    /// Redis connection URL; absent means single-process routing.
    /// Protected by `SecretString` to prevent accidental logging.
    pub redis_url: Option<SecretString>,

    /// Heartbeat interval (default: 3s).
    pub refresh_interval: Duration,

    /// Node record expiry (default: 10s). Must exceed `refresh_interval`.
    pub expire_after: Duration,

    /// RTC-side pipe idle timeout (default: 10s).
    pub idle_timeout: Duration,

    /// Per-direction pipe buffer capacity (default: 200 messages).
    pub channel_capacity: usize,

    /// Grace window for draining pipes on shutdown (default: 1s).
    pub drain_grace: Duration,

    /// Deadline applied to individual store and fabric operations
    /// (default: 5s).
    pub operation_timeout: Duration,
}

/// Custom Debug implementation that redacts the Redis URL.
impl fmt::Debug for RouterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterConfig")
            .field("node_id", &self.node_id)
            .field("node_ip", &self.node_ip)
            .field(
                "redis_url",
                &self.redis_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("refresh_interval", &self.refresh_interval)
            .field("expire_after", &self.expire_after)
            .field("idle_timeout", &self.idle_timeout)
            .field("channel_capacity", &self.channel_capacity)
            .field("drain_grace", &self.drain_grace)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl RouterConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let node_id = vars
            .get("ROUTER_NODE_ID")
            .cloned()
            .unwrap_or_else(generate_node_id);

        let node_ip = vars
            .get("ROUTER_NODE_IP")
            .cloned()
            .unwrap_or_else(|| "127.0.0.1".to_string());

        let redis_url = vars.get("REDIS_URL").cloned().map(SecretString::from);

        let refresh_interval = Duration::from_secs(
            vars.get("ROUTER_REFRESH_INTERVAL_SECONDS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_REFRESH_INTERVAL_SECONDS),
        );

        let expire_after = Duration::from_secs(
            vars.get("ROUTER_EXPIRE_AFTER_SECONDS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_EXPIRE_AFTER_SECONDS),
        );

        let idle_timeout = Duration::from_secs(
            vars.get("ROUTER_IDLE_TIMEOUT_SECONDS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECONDS),
        );

        let channel_capacity = vars
            .get("ROUTER_CHANNEL_CAPACITY")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CHANNEL_CAPACITY);

        let drain_grace = Duration::from_millis(
            vars.get("ROUTER_DRAIN_GRACE_MILLIS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_DRAIN_GRACE_MILLIS),
        );

        let operation_timeout = Duration::from_secs(
            vars.get("ROUTER_OPERATION_TIMEOUT_SECONDS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_OPERATION_TIMEOUT_SECONDS),
        );

        if expire_after <= refresh_interval {
            return Err(ConfigError::InvalidValue(format!(
                "expire_after ({expire_after:?}) must exceed refresh_interval ({refresh_interval:?})"
            )));
        }

        if channel_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "channel_capacity must be at least 1".to_string(),
            ));
        }

        Ok(RouterConfig {
            node_id,
            node_ip,
            redis_url,
            refresh_interval,
            expire_after,
            idle_timeout,
            channel_capacity,
            drain_grace,
            operation_timeout,
        })
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            node_id: generate_node_id(),
            node_ip: "127.0.0.1".to_string(),
            redis_url: None,
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECONDS),
            expire_after: Duration::from_secs(DEFAULT_EXPIRE_AFTER_SECONDS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECONDS),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            drain_grace: Duration::from_millis(DEFAULT_DRAIN_GRACE_MILLIS),
            operation_timeout: Duration::from_secs(DEFAULT_OPERATION_TIMEOUT_SECONDS),
        }
    }
}

/// Generate a node ID of the form `nd-<hostname>-<uuid8>`.
fn generate_node_id() -> String {
    let hostname = env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    let uuid_suffix = uuid::Uuid::new_v4().to_string();
    let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
    format!("{DEFAULT_NODE_ID_PREFIX}-{hostname}-{short_suffix}")
}
