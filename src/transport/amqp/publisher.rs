//! Publish helpers on top of a supervised connection
//!
//! Each publish re-reads the current channel from the handle, so a publisher
//! picks up a new session as soon as the supervisor swaps it in. A publish
//! racing a swap can still fail with [`BrokerError::ChannelClosed`]; callers
//! should treat that as retryable.

use super::supervisor::ConnectionHandle;
use super::topology::EMPTY_ROUTING_KEY;
use crate::error::RelayResult;
use crate::protocol::{RestRequest, CONTENT_TYPE_JSON, CONTENT_TYPE_TEXT, DISCORD_ROUTING_KEY};
use crate::transport::{Broker, BrokerChannel, BrokerError};
use tracing::{debug, error};

/// The nameless default exchange, which routes by queue name
pub const DEFAULT_EXCHANGE: &str = "";

pub struct Publisher<B: Broker> {
    handle: ConnectionHandle<B>,
    request_exchange: String,
}

impl<B: Broker> Clone for Publisher<B> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            request_exchange: self.request_exchange.clone(),
        }
    }
}

impl<B: Broker> Publisher<B> {
    pub fn new(handle: ConnectionHandle<B>, request_exchange: impl Into<String>) -> Self {
        Self {
            handle,
            request_exchange: request_exchange.into(),
        }
    }

    pub fn handle(&self) -> &ConnectionHandle<B> {
        &self.handle
    }

    /// Publish a REST envelope to the request exchange as JSON
    pub async fn publish_rest_request(&self, request: &RestRequest) -> RelayResult<()> {
        let body = request.to_json()?;
        self.publish_raw(&self.request_exchange, EMPTY_ROUTING_KEY, &body, CONTENT_TYPE_JSON)
            .await?;
        debug!(exchange = %self.request_exchange, path = %request.path, "Published REST request");
        Ok(())
    }

    /// Publish a plain-text message to the `discord` queue
    pub async fn send_to_discord(&self, message: &str) -> RelayResult<()> {
        self.publish_raw(
            DEFAULT_EXCHANGE,
            DISCORD_ROUTING_KEY,
            message.as_bytes(),
            CONTENT_TYPE_TEXT,
        )
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to publish message to Discord");
            e
        })?;
        Ok(())
    }

    async fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        content_type: &str,
    ) -> Result<(), BrokerError> {
        let channel = self.handle.channel();
        channel
            .publish(exchange, routing_key, body, content_type)
            .await
    }
}
