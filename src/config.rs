//! Relay configuration
//!
//! Configuration can come from an optional TOML file and is always overlaid
//! with the environment, so a bare process with no file still starts with the
//! documented defaults (`guest`/`guest` at `localhost:5672`).

use crate::transport::amqp::endpoint::{build_endpoints, is_valid_host, parse_host_list, Endpoint};
use crate::transport::amqp::lapin_broker::DEFAULT_DIAL_TIMEOUT_MS;
use crate::transport::amqp::retry::{RetryPolicy, DEFAULT_RETRY_DELAY_MS};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const ENV_QUEUE_USER: &str = "QUEUE_USER";
pub const ENV_QUEUE_PASSWORD: &str = "QUEUE_PASSWORD";
pub const ENV_QUEUE_HOSTS: &str = "QUEUE_HOSTS";
pub const ENV_QUEUE_RETRY_DELAY_MS: &str = "QUEUE_RETRY_DELAY_MS";
pub const ENV_QUEUE_DIAL_TIMEOUT_MS: &str = "QUEUE_DIAL_TIMEOUT_MS";
pub const ENV_REQUEST_EXCHANGE: &str = "REST_REQUEST_EXCHANGE";
pub const ENV_RETRY_EXCHANGE: &str = "REST_RETRY_EXCHANGE";
pub const ENV_RESPONSE_EXCHANGE: &str = "REST_RESPONSE_EXCHANGE";
pub const ENV_REQUEST_QUEUE: &str = "REST_REQUEST_QUEUE";
pub const ENV_RETRY_QUEUE: &str = "REST_RETRY_QUEUE";

/// Top-level relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub topology: TopologySection,
}

/// Broker credentials, candidate hosts and retry pacing
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_password")]
    pub password: String,
    /// Comma-separated `host:port` list, tried in order
    #[serde(default = "default_hosts")]
    pub hosts: String,
    /// Pause between failed sweeps
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Upper bound on a single dial, so an unreachable host cannot stall a sweep
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            user: default_user(),
            password: default_password(),
            hosts: default_hosts(),
            retry_delay_ms: default_retry_delay_ms(),
            dial_timeout_ms: default_dial_timeout_ms(),
        }
    }
}

impl std::fmt::Debug for BrokerSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSection")
            .field("user", &self.user)
            .field("password", &"****")
            .field("hosts", &self.hosts)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .field("dial_timeout_ms", &self.dial_timeout_ms)
            .finish()
    }
}

/// Exchange and queue names
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopologySection {
    #[serde(default = "default_request_exchange")]
    pub request_exchange: String,
    #[serde(default = "default_retry_exchange")]
    pub retry_exchange: String,
    #[serde(default = "default_response_exchange")]
    pub response_exchange: String,
    #[serde(default = "default_request_queue")]
    pub request_queue: String,
    #[serde(default = "default_retry_queue")]
    pub retry_queue: String,
}

impl Default for TopologySection {
    fn default() -> Self {
        Self {
            request_exchange: default_request_exchange(),
            retry_exchange: default_retry_exchange(),
            response_exchange: default_response_exchange(),
            request_queue: default_request_queue(),
            retry_queue: default_retry_queue(),
        }
    }
}

fn default_user() -> String {
    "guest".to_string()
}

fn default_password() -> String {
    "guest".to_string()
}

fn default_hosts() -> String {
    "localhost:5672".to_string()
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

fn default_dial_timeout_ms() -> u64 {
    DEFAULT_DIAL_TIMEOUT_MS
}

fn default_request_exchange() -> String {
    "restRequests".to_string()
}

fn default_retry_exchange() -> String {
    "restRequestsRetry".to_string()
}

fn default_response_exchange() -> String {
    "restResponses".to_string()
}

fn default_request_queue() -> String {
    "restRequestsQueue".to_string()
}

fn default_retry_queue() -> String {
    "restRetryQueue".to_string()
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RelayConfig {
    /// Load from a TOML file, then apply environment overrides
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: RelayConfig = toml::from_str(&content)?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with the environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = RelayConfig::default();
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from `lookup`, which maps a variable name to its value
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string_fields: [(&str, &mut String); 8] = [
            (ENV_QUEUE_USER, &mut self.broker.user),
            (ENV_QUEUE_PASSWORD, &mut self.broker.password),
            (ENV_QUEUE_HOSTS, &mut self.broker.hosts),
            (ENV_REQUEST_EXCHANGE, &mut self.topology.request_exchange),
            (ENV_RETRY_EXCHANGE, &mut self.topology.retry_exchange),
            (ENV_RESPONSE_EXCHANGE, &mut self.topology.response_exchange),
            (ENV_REQUEST_QUEUE, &mut self.topology.request_queue),
            (ENV_RETRY_QUEUE, &mut self.topology.retry_queue),
        ];

        for (name, field) in string_fields {
            if let Some(value) = lookup(name) {
                *field = value;
            }
        }

        let millis_fields: [(&str, &mut u64); 2] = [
            (ENV_QUEUE_RETRY_DELAY_MS, &mut self.broker.retry_delay_ms),
            (ENV_QUEUE_DIAL_TIMEOUT_MS, &mut self.broker.dial_timeout_ms),
        ];

        for (name, field) in millis_fields {
            if let Some(value) = lookup(name) {
                *field = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    name: name.to_string(),
                    value,
                })?;
            }
        }

        Ok(())
    }

    /// Reject configurations the supervisor cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let hosts = parse_host_list(&self.broker.hosts);
        if hosts.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker host list must contain at least one host".to_string(),
            ));
        }
        if let Some(bad) = hosts.iter().find(|host| !is_valid_host(host)) {
            return Err(ConfigError::InvalidConfig(format!(
                "broker host '{bad}' is not a host[:port]"
            )));
        }
        if self.broker.dial_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.dial_timeout_ms must be greater than zero".to_string(),
            ));
        }

        let names = [
            ("request_exchange", &self.topology.request_exchange),
            ("retry_exchange", &self.topology.retry_exchange),
            ("response_exchange", &self.topology.response_exchange),
            ("request_queue", &self.topology.request_queue),
            ("retry_queue", &self.topology.retry_queue),
        ];
        for (field, value) in names {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "topology.{field} must not be empty"
                )));
            }
        }

        Ok(())
    }

    /// Ordered candidate endpoints built from credentials and host list
    pub fn endpoints(&self) -> Vec<Endpoint> {
        build_endpoints(&self.broker.user, &self.broker.password, &self.broker.hosts)
    }

    /// Retry policy for dial/declare loops
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(Duration::from_millis(self.broker.retry_delay_ms))
    }

    /// Bound applied to each dial attempt
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.broker.dial_timeout_ms)
    }
}
