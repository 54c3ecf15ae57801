//! Relay exchange/queue topology
//!
//! The topology implements delayed retry through dead-lettering: messages
//! rejected or expired on the request queue go to the retry exchange, sit in
//! the retry queue for a fixed TTL, then dead-letter back to the request
//! exchange. There is no retry limit; a message can cycle indefinitely.
//!
//! Declaration order is load-bearing. Exchanges come first, then queues
//! (which reference the exchanges as dead-letter targets), then bindings.

use crate::config::TopologySection;
use crate::transport::{BrokerChannel, BrokerError};
use thiserror::Error;
use tracing::{debug, error};

/// Fixed time-to-live for messages parked in the retry queue
pub const RETRY_MESSAGE_TTL_MS: u32 = 1000;

/// Routing key used on every binding and on request publishes
pub const EMPTY_ROUTING_KEY: &str = "";

/// Broker exchange types used by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeType,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn durable_direct(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ExchangeType::Direct,
            durable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// `x-dead-letter-exchange` argument
    pub dead_letter_exchange: Option<String>,
    /// `x-message-ttl` argument
    pub message_ttl_ms: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// Which kind of resource a declaration step targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Channel,
    Exchange,
    Queue,
    Binding,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Channel => f.write_str("channel"),
            ResourceKind::Exchange => f.write_str("exchange"),
            ResourceKind::Queue => f.write_str("queue"),
            ResourceKind::Binding => f.write_str("binding"),
        }
    }
}

/// A declaration step failed; the whole attempt must be restarted
#[derive(Debug, Error, Clone, PartialEq)]
#[error("Failed to declare {kind} {resource}: {source}")]
pub struct TopologyError {
    pub kind: ResourceKind,
    pub resource: String,
    #[source]
    pub source: BrokerError,
}

/// The complete set of resources the relay depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<BindingSpec>,
}

impl Topology {
    /// Build the request/retry/response topology from configured names
    pub fn from_names(names: &TopologySection) -> Self {
        let exchanges = vec![
            ExchangeSpec::durable_direct(&names.request_exchange),
            ExchangeSpec::durable_direct(&names.retry_exchange),
            ExchangeSpec::durable_direct(&names.response_exchange),
        ];

        let queues = vec![
            QueueSpec {
                name: names.request_queue.clone(),
                durable: true,
                dead_letter_exchange: Some(names.retry_exchange.clone()),
                message_ttl_ms: None,
            },
            QueueSpec {
                name: names.retry_queue.clone(),
                durable: true,
                dead_letter_exchange: Some(names.request_exchange.clone()),
                message_ttl_ms: Some(RETRY_MESSAGE_TTL_MS),
            },
        ];

        let bindings = vec![
            BindingSpec {
                queue: names.request_queue.clone(),
                exchange: names.request_exchange.clone(),
                routing_key: EMPTY_ROUTING_KEY.to_string(),
            },
            BindingSpec {
                queue: names.retry_queue.clone(),
                exchange: names.retry_exchange.clone(),
                routing_key: EMPTY_ROUTING_KEY.to_string(),
            },
        ];

        Self {
            exchanges,
            queues,
            bindings,
        }
    }

    /// Declare every resource on `channel`, strictly exchanges → queues → bindings
    ///
    /// Stops at the first failure. Already-declared resources are not tracked,
    /// so callers must restart from a fresh connection rather than resume.
    pub async fn declare<C: BrokerChannel + ?Sized>(&self, channel: &C) -> Result<(), TopologyError> {
        for exchange in &self.exchanges {
            debug!(exchange = %exchange.name, "Declaring exchange");
            channel
                .declare_exchange(exchange)
                .await
                .map_err(|source| fail(ResourceKind::Exchange, &exchange.name, source))?;
        }

        for queue in &self.queues {
            debug!(
                queue = %queue.name,
                dead_letter_exchange = ?queue.dead_letter_exchange,
                message_ttl_ms = ?queue.message_ttl_ms,
                "Declaring queue"
            );
            channel
                .declare_queue(queue)
                .await
                .map_err(|source| fail(ResourceKind::Queue, &queue.name, source))?;
        }

        for binding in &self.bindings {
            debug!(queue = %binding.queue, exchange = %binding.exchange, "Binding queue");
            channel.bind_queue(binding).await.map_err(|source| {
                fail(
                    ResourceKind::Binding,
                    &format!("{} -> {}", binding.exchange, binding.queue),
                    source,
                )
            })?;
        }

        Ok(())
    }

    /// Names of all exchanges and queues, in declaration order
    pub fn resource_names(&self) -> Vec<&str> {
        self.exchanges
            .iter()
            .map(|e| e.name.as_str())
            .chain(self.queues.iter().map(|q| q.name.as_str()))
            .collect()
    }
}

fn fail(kind: ResourceKind, resource: &str, source: BrokerError) -> TopologyError {
    error!(kind = %kind, resource = %resource, error = %source, "Topology declaration failed");
    TopologyError {
        kind,
        resource: resource.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_topology_shape() {
        let topology = Topology::from_names(&TopologySection::default());

        assert_eq!(
            topology.resource_names(),
            vec![
                "restRequests",
                "restRequestsRetry",
                "restResponses",
                "restRequestsQueue",
                "restRetryQueue"
            ]
        );
        assert!(topology.exchanges.iter().all(|e| e.durable));
        assert!(topology
            .exchanges
            .iter()
            .all(|e| e.kind == ExchangeType::Direct));
    }

    #[test]
    fn test_dead_letter_cycle() {
        let topology = Topology::from_names(&TopologySection::default());
        let request = &topology.queues[0];
        let retry = &topology.queues[1];

        assert_eq!(request.dead_letter_exchange.as_deref(), Some("restRequestsRetry"));
        assert_eq!(request.message_ttl_ms, None);
        assert_eq!(retry.dead_letter_exchange.as_deref(), Some("restRequests"));
        assert_eq!(retry.message_ttl_ms, Some(1000));
    }

    #[test]
    fn test_bindings_use_empty_routing_key() {
        let topology = Topology::from_names(&TopologySection::default());
        assert_eq!(topology.bindings.len(), 2);
        assert!(topology.bindings.iter().all(|b| b.routing_key.is_empty()));
        assert_eq!(topology.bindings[0].queue, "restRequestsQueue");
        assert_eq!(topology.bindings[0].exchange, "restRequests");
        assert_eq!(topology.bindings[1].queue, "restRetryQueue");
        assert_eq!(topology.bindings[1].exchange, "restRequestsRetry");
    }

    #[test]
    fn test_overridden_names() {
        let names = TopologySection {
            request_exchange: "req".to_string(),
            retry_exchange: "req.retry".to_string(),
            response_exchange: "resp".to_string(),
            request_queue: "req.q".to_string(),
            retry_queue: "req.retry.q".to_string(),
        };
        let topology = Topology::from_names(&names);
        assert_eq!(topology.queues[1].dead_letter_exchange.as_deref(), Some("req"));
        assert_eq!(topology.bindings[1].exchange, "req.retry");
    }

    #[test]
    fn test_topology_error_names_resource() {
        let err = TopologyError {
            kind: ResourceKind::Queue,
            resource: "restRetryQueue".to_string(),
            source: BrokerError::PreconditionFailed("inequivalent arg 'x-message-ttl'".to_string()),
        };
        let text = err.to_string();
        assert!(text.contains("queue restRetryQueue"));
        assert!(text.contains("x-message-ttl"));
    }
}
