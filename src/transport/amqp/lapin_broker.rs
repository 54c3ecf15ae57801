//! AMQP 0-9-1 broker backend on `lapin`
//!
//! Authentication and protocol negotiation are left to `lapin`. This module
//! maps the relay's topology specs onto AMQP arguments and turns the client's
//! connection lifecycle into a [`CloseNotifier`].
//!
//! `lapin` reports failures through `Connection::on_error`, but an orderly
//! server-initiated `Connection.Close` only flips the connection status. Both
//! sources feed the same close notification.

use super::endpoint::Endpoint;
use super::topology::{BindingSpec, ExchangeSpec, ExchangeType, QueueSpec};
use crate::transport::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, CloseNotifier, CloseReason,
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
pub const MESSAGE_TTL_ARG: &str = "x-message-ttl";

/// Default bound on a single dial attempt
pub const DEFAULT_DIAL_TIMEOUT_MS: u64 = 30_000;

/// How often the connection status is checked for a server-side close
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Reply code sent when the relay closes a connection itself
const REPLY_SUCCESS: u16 = 200;

type CloseSender = Arc<watch::Sender<Option<CloseReason>>>;

/// Dials brokers with `lapin`
#[derive(Clone)]
pub struct LapinBroker {
    properties: ConnectionProperties,
    dial_timeout: Duration,
}

impl Default for LapinBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LapinBroker {
    pub fn new() -> Self {
        Self {
            properties: ConnectionProperties::default()
                .with_connection_name(env!("CARGO_PKG_NAME").into()),
            dial_timeout: Duration::from_millis(DEFAULT_DIAL_TIMEOUT_MS),
        }
    }

    /// Give up on a dial after `timeout` and move to the next candidate
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }
}

#[async_trait]
impl Broker for LapinBroker {
    type Connection = LapinConnection;

    async fn dial(&self, endpoint: &Endpoint) -> Result<LapinConnection, BrokerError> {
        let connect = Connection::connect(endpoint.uri(), self.properties.clone());
        let connection = match tokio::time::timeout(self.dial_timeout, connect).await {
            Ok(result) => result.map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?,
            Err(_) => {
                return Err(BrokerError::ConnectionFailed(format!(
                    "dial to {} timed out after {} ms",
                    endpoint.redacted(),
                    self.dial_timeout.as_millis()
                )))
            }
        };

        let (close_tx, close_rx) = watch::channel(None);
        let close_tx: CloseSender = Arc::new(close_tx);
        let closing = Arc::new(AtomicBool::new(false));

        let on_error_tx = Arc::clone(&close_tx);
        connection.on_error(move |err| {
            report_close(&on_error_tx, CloseReason::Error(err.to_string()));
        });

        let status = connection.status().clone();
        tokio::spawn(watch_connection_status(
            move || status.connected(),
            close_tx,
            Arc::clone(&closing),
            STATUS_POLL_INTERVAL,
        ));

        Ok(LapinConnection {
            connection,
            close_rx,
            closing,
        })
    }
}

/// Record the first close reason; later reports for the same connection are dropped
fn report_close(close_tx: &watch::Sender<Option<CloseReason>>, reason: CloseReason) -> bool {
    close_tx.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(reason);
        true
    })
}

/// Poll `is_connected` until it turns false, then report a close
///
/// Returns without reporting when the relay closed the connection itself
/// (`closing` set), when another source already reported a close, or when
/// every notifier for the connection has been dropped.
pub async fn watch_connection_status<F>(
    is_connected: F,
    close_tx: CloseSender,
    closing: Arc<AtomicBool>,
    interval: Duration,
) where
    F: Fn() -> bool + Send + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = close_tx.closed() => return,
            _ = ticker.tick() => {
                if close_tx.borrow().is_some() || closing.load(Ordering::SeqCst) {
                    return;
                }
                if !is_connected() {
                    report_close(
                        &close_tx,
                        CloseReason::Error("connection closed by broker".to_string()),
                    );
                    return;
                }
            }
        }
    }
}

/// A `lapin` connection with its close notification source
pub struct LapinConnection {
    connection: Connection,
    close_rx: watch::Receiver<Option<CloseReason>>,
    closing: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    type Channel = LapinChannel;

    async fn open_channel(&self) -> Result<LapinChannel, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| classify(e, BrokerError::ChannelFailed))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| classify(e, BrokerError::ChannelFailed))?;
        Ok(LapinChannel { channel })
    }

    fn close_notifier(&self) -> CloseNotifier {
        CloseNotifier::from_receiver(self.close_rx.clone())
    }

    async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Err(e) = self.connection.close(REPLY_SUCCESS, "OK").await {
            debug!(error = %e, "Ignoring error while closing broker connection");
        }
    }
}

/// A `lapin` channel
#[derive(Clone)]
pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError> {
        let kind = match exchange.kind {
            ExchangeType::Direct => ExchangeKind::Direct,
        };

        self.channel
            .exchange_declare(
                &exchange.name,
                kind,
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify(e, BrokerError::DeclareFailed))
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    auto_delete: false,
                    exclusive: false,
                    nowait: false,
                    passive: false,
                },
                queue_arguments(queue),
            )
            .await
            .map(|_| ())
            .map_err(|e| classify(e, BrokerError::DeclareFailed))
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify(e, BrokerError::DeclareFailed))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        content_type: &str,
    ) -> Result<(), BrokerError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: false,
                    immediate: false,
                },
                body,
                BasicProperties::default().with_content_type(content_type.into()),
            )
            .await
            .map_err(|e| classify(e, BrokerError::PublishFailed))?
            .await
            .map_err(|e| classify(e, BrokerError::PublishFailed))?;

        if confirm.is_nack() {
            return Err(BrokerError::PublishFailed(
                "publisher confirm NACK".to_string(),
            ));
        }
        Ok(())
    }
}

/// AMQP arguments for a queue spec
pub fn queue_arguments(queue: &QueueSpec) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(dlx) = &queue.dead_letter_exchange {
        args.insert(
            DEAD_LETTER_EXCHANGE_ARG.into(),
            AMQPValue::LongString(dlx.clone().into()),
        );
    }
    if let Some(ttl) = queue.message_ttl_ms {
        args.insert(MESSAGE_TTL_ARG.into(), AMQPValue::LongLongInt(i64::from(ttl)));
    }
    args
}

/// Map a `lapin` error onto the transport taxonomy
fn classify(error: lapin::Error, fallback: fn(String) -> BrokerError) -> BrokerError {
    let message = error.to_string();
    match error {
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            BrokerError::ChannelClosed(message)
        }
        _ if message.contains("PRECONDITION_FAILED") => BrokerError::PreconditionFailed(message),
        _ => fallback(message),
    }
}
