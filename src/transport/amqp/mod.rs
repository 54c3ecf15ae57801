//! AMQP connection management for the relay
//!
//! # Architecture
//!
//! - [`endpoint`] - Candidate URIs and credential redaction
//! - [`retry`] - Unbounded retry pacing
//! - [`topology`] - Exchange/queue/binding declaration in dependency order
//! - [`supervisor`] - Dial, declare, watch for close, reconnect
//! - [`lapin_broker`] - `lapin` implementation of the broker traits
//! - [`publisher`] - JSON and plain-text publish helpers
//!
//! # Usage
//!
//! ```rust,no_run
//! use amqp_relay::config::RelayConfig;
//! use amqp_relay::transport::amqp::{ConnectionSupervisor, LapinBroker, Publisher};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = RelayConfig::from_env()?;
//! let supervisor = Arc::new(ConnectionSupervisor::from_config(LapinBroker::new(), &config));
//!
//! // Blocks until a broker accepts and the topology is declared
//! let handle = supervisor.acquire().await;
//! let publisher = Publisher::new(handle, config.topology.request_exchange.clone());
//! publisher.send_to_discord("hello").await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod endpoint;
pub mod lapin_broker;
pub mod publisher;
pub mod retry;
pub mod supervisor;
pub mod topology;

pub use endpoint::{build_endpoints, redact_uri, Endpoint};
pub use lapin_broker::{LapinBroker, LapinChannel, LapinConnection};
pub use publisher::Publisher;
pub use retry::RetryPolicy;
pub use supervisor::{
    ConnectionHandle, ConnectionSupervisor, Session, SessionState, SessionStatus,
    SupervisorMetrics,
};
pub use topology::{Topology, TopologyError};
