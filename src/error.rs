//! Error types for the relay
//!
//! Nothing in the connection supervisor returns a terminal error; these types
//! cover configuration, publishing and serialization at the relay's edges.

use crate::config::ConfigError;
use crate::transport::amqp::topology::TopologyError;
use crate::transport::BrokerError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for relay operations
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No bot token found in {env}")]
    MissingToken { env: String },
}

impl RelayError {
    /// Whether retrying the operation on a fresh session may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::Broker(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub fn missing_token<S: Into<String>>(env: S) -> Self {
        Self::MissingToken { env: env.into() }
    }
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

static URI_CREDENTIALS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(amqps?://[^:/@\s]*):\S*@").expect("credential pattern is valid")
});

static SECRET_ASSIGNMENTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

/// Scrub credentials from free-form error text before it is logged
///
/// Broker client errors can echo the URI they dialed; the password part of
/// any `amqp://user:password@` is masked, as are `password=`-style pairs.
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = URI_CREDENTIALS.replace_all(message, "${1}:****@");
    SECRET_ASSIGNMENTS
        .replace_all(&sanitized, "${1}=***")
        .to_string()
}
