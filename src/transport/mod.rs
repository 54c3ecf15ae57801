//! Transport layer for broker communication
//!
//! This module provides the broker abstraction used by the connection
//! supervisor, and the AMQP implementation built on `lapin`.
//!
//! The traits are narrow: dialing, opening a channel, waiting for
//! a close notification, and the handful of declare/publish operations the
//! relay topology needs. Everything above them (retry, topology ordering,
//! reconnect) lives in [`amqp::supervisor`] and is exercised against the
//! in-memory [`crate::testing::MockBroker`] as well as a real broker.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

pub mod amqp;

use amqp::endpoint::Endpoint;
use amqp::topology::{BindingSpec, ExchangeSpec, QueueSpec};

/// Broker transport errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Channel open failed: {0}")]
    ChannelFailed(String),
    #[error("Declaration failed: {0}")]
    DeclareFailed(String),
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("Publishing failed: {0}")]
    PublishFailed(String),
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl BrokerError {
    /// Whether a publish that failed with this error may succeed on a fresh session
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::ChannelClosed(_)
                | BrokerError::ConnectionFailed(_)
                | BrokerError::ChannelFailed(_)
        )
    }
}

/// Why a broker connection stopped being usable
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// The broker client reported an error or a server-initiated close
    Error(String),
    /// The notification source went away together with the connection
    Dropped,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Error(reason) => write!(f, "{reason}"),
            CloseReason::Dropped => write!(f, "close notification source dropped"),
        }
    }
}

/// Single-shot future over a connection's close notification
#[derive(Debug)]
pub struct CloseNotifier {
    rx: watch::Receiver<Option<CloseReason>>,
}

impl CloseNotifier {
    /// Create a notification pair; the sender is held by whatever observes the connection
    pub fn channel() -> (watch::Sender<Option<CloseReason>>, CloseNotifier) {
        let (tx, rx) = watch::channel(None);
        (tx, CloseNotifier { rx })
    }

    pub fn from_receiver(rx: watch::Receiver<Option<CloseReason>>) -> Self {
        Self { rx }
    }

    /// Suspend until the connection is closed
    ///
    /// Every close is reported uniformly, an orderly server close as much as a
    /// network failure. A vanished sender counts as a close.
    pub async fn closed(mut self) -> CloseReason {
        self.rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|reason| (*reason).clone())
            .unwrap_or(CloseReason::Dropped)
    }
}

/// A broker that can be dialed at a given endpoint
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Attempt a single connection to `endpoint`
    async fn dial(&self, endpoint: &Endpoint) -> Result<Self::Connection, BrokerError>;
}

/// A live connection to a broker
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel + Clone;

    /// Open a new channel on this connection
    async fn open_channel(&self) -> Result<Self::Channel, BrokerError>;

    /// Subscribe to the close notification of this connection
    fn close_notifier(&self) -> CloseNotifier;

    /// Close the connection; errors are ignored since the connection is being discarded
    async fn close(&self);
}

/// Channel operations needed for topology declaration and publishing
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError>;

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), BrokerError>;

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        content_type: &str,
    ) -> Result<(), BrokerError>;
}

/// Channel type of a broker's connections
pub type ChannelOf<B> = <<B as Broker>::Connection as BrokerConnection>::Channel;

/// Type alias for the production AMQP broker
pub type AmqpBroker = amqp::LapinBroker;
