//! Mock implementations for testing
//!
//! [`MockBroker`] emulates the parts of an AMQP broker the relay relies on:
//! per-host accept/refuse behaviour, idempotent declarations with argument
//! equivalence checks, direct and default-exchange routing, dead-lettering on
//! expiry or rejection, and server-side connection closes. State lives on the
//! broker, not the connection, so declarations survive a reconnect just as
//! they would on a real broker.

use crate::transport::amqp::endpoint::Endpoint;
use crate::transport::amqp::topology::{BindingSpec, ExchangeSpec, QueueSpec};
use crate::transport::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, CloseNotifier, CloseReason,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// How a host responds to dial attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostBehavior {
    Accept,
    Refuse,
    /// Refuse this many more attempts, then accept
    AcceptAfter(u32),
}

/// A message sitting in a mock queue or recorded as published
#[derive(Debug, Clone, PartialEq)]
pub struct MockMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug)]
struct MockQueue {
    spec: QueueSpec,
    messages: Vec<MockMessage>,
}

#[derive(Debug)]
struct ConnectionLink {
    host: String,
    open: AtomicBool,
    close_tx: watch::Sender<Option<CloseReason>>,
}

#[derive(Debug)]
struct BrokerState {
    default_behavior: HostBehavior,
    hosts: HashMap<String, HostBehavior>,
    dial_log: Vec<String>,
    connections: Vec<Arc<ConnectionLink>>,
    exchanges: BTreeMap<String, ExchangeSpec>,
    queues: BTreeMap<String, MockQueue>,
    bindings: Vec<BindingSpec>,
    declaration_log: Vec<String>,
    injected_failures: Vec<String>,
    published: Vec<MockMessage>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            default_behavior: HostBehavior::Accept,
            hosts: HashMap::new(),
            dial_log: Vec::new(),
            connections: Vec::new(),
            exchanges: BTreeMap::new(),
            queues: BTreeMap::new(),
            bindings: Vec::new(),
            declaration_log: Vec::new(),
            injected_failures: Vec::new(),
            published: Vec::new(),
        }
    }
}

impl BrokerState {
    fn take_injected_failure(&mut self, resource: &str) -> Option<BrokerError> {
        let index = self.injected_failures.iter().position(|r| r == resource)?;
        self.injected_failures.remove(index);
        Some(BrokerError::DeclareFailed(format!(
            "ACCESS_REFUSED - injected failure for '{resource}'"
        )))
    }

    fn route(&mut self, message: MockMessage) {
        if message.exchange.is_empty() {
            if let Some(queue) = self.queues.get_mut(&message.routing_key) {
                queue.messages.push(message);
            }
            return;
        }

        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == message.exchange && b.routing_key == message.routing_key)
            .map(|b| b.queue.clone())
            .collect();

        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.messages.push(message.clone());
            }
        }
    }

    fn dead_letter(&mut self, queue_name: &str) -> usize {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return 0;
        };
        let Some(dlx) = queue.spec.dead_letter_exchange.clone() else {
            queue.messages.clear();
            return 0;
        };

        let messages = std::mem::take(&mut queue.messages);
        let count = messages.len();
        for message in messages {
            self.route(MockMessage {
                exchange: dlx.clone(),
                ..message
            });
        }
        count
    }
}

/// In-memory broker for supervisor and topology tests
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    /// A broker where every host accepts
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker where every host refuses until told otherwise
    pub async fn refusing() -> Self {
        let broker = Self::default();
        broker.state.lock().await.default_behavior = HostBehavior::Refuse;
        broker
    }

    pub async fn set_host_behavior(&self, host: &str, behavior: HostBehavior) {
        self.state
            .lock()
            .await
            .hosts
            .insert(host.to_string(), behavior);
    }

    pub async fn refuse_host(&self, host: &str) {
        self.set_host_behavior(host, HostBehavior::Refuse).await;
    }

    pub async fn accept_host(&self, host: &str) {
        self.set_host_behavior(host, HostBehavior::Accept).await;
    }

    /// Hosts dialed so far, in order
    pub async fn dial_log(&self) -> Vec<String> {
        self.state.lock().await.dial_log.clone()
    }

    /// Resources declared so far, as `kind:name`, in order
    pub async fn declaration_log(&self) -> Vec<String> {
        self.state.lock().await.declaration_log.clone()
    }

    /// Make the next declaration of `resource` fail once
    pub async fn fail_next_declaration(&self, resource: &str) {
        self.state
            .lock()
            .await
            .injected_failures
            .push(resource.to_string());
    }

    /// Server-side close of every open connection; returns how many were closed
    pub async fn close_all_connections(&self, reason: &str) -> usize {
        let state = self.state.lock().await;
        let mut closed = 0;
        for link in &state.connections {
            if link.open.swap(false, Ordering::SeqCst) {
                link.close_tx
                    .send_replace(Some(CloseReason::Error(reason.to_string())));
                closed += 1;
            }
        }
        closed
    }

    pub async fn open_connections(&self) -> usize {
        self.state
            .lock()
            .await
            .connections
            .iter()
            .filter(|link| link.open.load(Ordering::SeqCst))
            .count()
    }

    /// Hosts of every connection ever accepted, in order
    pub async fn accepted_hosts(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .connections
            .iter()
            .map(|link| link.host.clone())
            .collect()
    }

    pub async fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.state.lock().await.exchanges.get(name).cloned()
    }

    pub async fn queue(&self, name: &str) -> Option<QueueSpec> {
        self.state
            .lock()
            .await
            .queues
            .get(name)
            .map(|q| q.spec.clone())
    }

    pub async fn exchange_names(&self) -> Vec<String> {
        self.state.lock().await.exchanges.keys().cloned().collect()
    }

    pub async fn queue_names(&self) -> Vec<String> {
        self.state.lock().await.queues.keys().cloned().collect()
    }

    pub async fn bindings(&self) -> Vec<BindingSpec> {
        self.state.lock().await.bindings.clone()
    }

    /// Declare a queue out of band, as another client might
    pub async fn predeclare_queue(&self, spec: QueueSpec) {
        self.state.lock().await.queues.insert(
            spec.name.clone(),
            MockQueue {
                spec,
                messages: Vec::new(),
            },
        );
    }

    pub async fn queue_messages(&self, name: &str) -> Vec<MockMessage> {
        self.state
            .lock()
            .await
            .queues
            .get(name)
            .map(|q| q.messages.clone())
            .unwrap_or_default()
    }

    /// Every publish accepted by the broker, routed or not
    pub async fn published(&self) -> Vec<MockMessage> {
        self.state.lock().await.published.clone()
    }

    /// Let the TTL of every message in `queue` elapse, dead-lettering them
    pub async fn expire_messages(&self, queue: &str) -> usize {
        self.state.lock().await.dead_letter(queue)
    }

    /// Reject every message in `queue` without requeue, dead-lettering them
    pub async fn reject_messages(&self, queue: &str) -> usize {
        self.state.lock().await.dead_letter(queue)
    }
}

#[async_trait]
impl Broker for MockBroker {
    type Connection = MockConnection;

    async fn dial(&self, endpoint: &Endpoint) -> Result<MockConnection, BrokerError> {
        let mut state = self.state.lock().await;
        let host = endpoint.host().to_string();
        state.dial_log.push(host.clone());

        let behavior = state
            .hosts
            .get(&host)
            .copied()
            .unwrap_or(state.default_behavior);

        let accept = match behavior {
            HostBehavior::Accept => true,
            HostBehavior::Refuse => false,
            HostBehavior::AcceptAfter(0) => {
                state.hosts.insert(host.clone(), HostBehavior::Accept);
                true
            }
            HostBehavior::AcceptAfter(remaining) => {
                state
                    .hosts
                    .insert(host.clone(), HostBehavior::AcceptAfter(remaining - 1));
                false
            }
        };

        if !accept {
            return Err(BrokerError::ConnectionFailed(format!(
                "Connection refused by {}",
                endpoint.redacted()
            )));
        }

        let (close_tx, _) = watch::channel(None);
        let link = Arc::new(ConnectionLink {
            host,
            open: AtomicBool::new(true),
            close_tx,
        });
        state.connections.push(Arc::clone(&link));

        Ok(MockConnection {
            state: Arc::clone(&self.state),
            link,
        })
    }
}

/// Connection to a [`MockBroker`]
#[derive(Debug)]
pub struct MockConnection {
    state: Arc<Mutex<BrokerState>>,
    link: Arc<ConnectionLink>,
}

impl MockConnection {
    pub fn is_open(&self) -> bool {
        self.link.open.load(Ordering::SeqCst)
    }

    pub fn host(&self) -> &str {
        &self.link.host
    }
}

#[async_trait]
impl BrokerConnection for MockConnection {
    type Channel = MockChannel;

    async fn open_channel(&self) -> Result<MockChannel, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::ChannelFailed("connection is closed".to_string()));
        }
        Ok(MockChannel {
            state: Arc::clone(&self.state),
            link: Arc::clone(&self.link),
        })
    }

    fn close_notifier(&self) -> CloseNotifier {
        CloseNotifier::from_receiver(self.link.close_tx.subscribe())
    }

    async fn close(&self) {
        self.link.open.store(false, Ordering::SeqCst);
    }
}

/// Channel on a [`MockConnection`]
#[derive(Debug, Clone)]
pub struct MockChannel {
    state: Arc<Mutex<BrokerState>>,
    link: Arc<ConnectionLink>,
}

impl MockChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.link.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed(
                "channel belongs to a closed connection".to_string(),
            ))
        }
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        if let Some(err) = state.take_injected_failure(&exchange.name) {
            return Err(err);
        }

        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing != exchange => {
                return Err(BrokerError::PreconditionFailed(format!(
                    "PRECONDITION_FAILED - inequivalent arg for exchange '{}'",
                    exchange.name
                )));
            }
            Some(_) => {}
            None => {
                state
                    .exchanges
                    .insert(exchange.name.clone(), exchange.clone());
            }
        }

        state
            .declaration_log
            .push(format!("exchange:{}", exchange.name));
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        if let Some(err) = state.take_injected_failure(&queue.name) {
            return Err(err);
        }

        if let Some(dlx) = &queue.dead_letter_exchange {
            if !state.exchanges.contains_key(dlx) {
                return Err(BrokerError::DeclareFailed(format!(
                    "NOT_FOUND - dead-letter exchange '{dlx}' for queue '{}'",
                    queue.name
                )));
            }
        }

        match state.queues.get(&queue.name) {
            Some(existing) if existing.spec != *queue => {
                return Err(BrokerError::PreconditionFailed(format!(
                    "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                    queue.name
                )));
            }
            Some(_) => {}
            None => {
                state.queues.insert(
                    queue.name.clone(),
                    MockQueue {
                        spec: queue.clone(),
                        messages: Vec::new(),
                    },
                );
            }
        }

        state.declaration_log.push(format!("queue:{}", queue.name));
        Ok(())
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;

        if !state.queues.contains_key(&binding.queue) {
            return Err(BrokerError::DeclareFailed(format!(
                "NOT_FOUND - no queue '{}'",
                binding.queue
            )));
        }
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(BrokerError::DeclareFailed(format!(
                "NOT_FOUND - no exchange '{}'",
                binding.exchange
            )));
        }

        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        state
            .declaration_log
            .push(format!("binding:{}->{}", binding.exchange, binding.queue));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        content_type: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;

        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::PublishFailed(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }

        let message = MockMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            content_type: content_type.to_string(),
        };
        state.published.push(message.clone());
        state.route(message);
        Ok(())
    }
}
