//! Relay message types
//!
//! The relay publishes two kinds of payload: a JSON REST request envelope
//! that a downstream HTTP relay turns into a chat-platform API call, and a
//! plain-text notice routed straight to the `discord` queue.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

/// Routing key for plain-text notices on the default exchange
pub const DISCORD_ROUTING_KEY: &str = "discord";

/// Chat platform API version used in request paths
pub const DISCORD_API_VERSION: u8 = 10;

/// REST request envelope consumed by the HTTP relay
///
/// # Examples
/// ```
/// use amqp_relay::protocol::RestRequest;
///
/// let request = RestRequest::create_message("123456", "bot-token", "Hello there");
/// assert_eq!(request.method, "POST");
/// assert_eq!(request.path, "/api/v10/channels/123456/messages");
/// ```
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct RestRequest {
    /// HTTP headers, including authorization
    pub headers: BTreeMap<String, String>,
    /// JSON request body
    pub body: Value,
    /// HTTP method
    pub method: String,
    /// API path relative to the platform base URL
    pub path: String,
}

impl RestRequest {
    /// Build a "create message" request for a channel, authenticated as a bot
    pub fn create_message(channel_id: &str, bot_token: &str, content: &str) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), format!("Bot {bot_token}"));
        headers.insert("Content-Type".to_string(), CONTENT_TYPE_JSON.to_string());

        Self {
            headers,
            body: serde_json::json!({ "content": content }),
            method: "POST".to_string(),
            path: format!("/api/v{DISCORD_API_VERSION}/channels/{channel_id}/messages"),
        }
    }

    /// Serialize to the JSON wire form
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl std::fmt::Debug for RestRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let headers: BTreeMap<&str, &str> = self
            .headers
            .iter()
            .map(|(name, value)| {
                if name.eq_ignore_ascii_case("authorization") {
                    (name.as_str(), "****")
                } else {
                    (name.as_str(), value.as_str())
                }
            })
            .collect();

        f.debug_struct("RestRequest")
            .field("headers", &headers)
            .field("body", &self.body)
            .field("method", &self.method)
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_message_envelope() {
        let request = RestRequest::create_message("42", "abc.def", "hi");

        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/api/v10/channels/42/messages");
        assert_eq!(request.headers["Authorization"], "Bot abc.def");
        assert_eq!(request.headers["Content-Type"], "application/json");
        assert_eq!(request.body, json!({"content": "hi"}));
    }

    #[test]
    fn test_wire_format() {
        let request = RestRequest::create_message("42", "tok", "hi");
        let wire: Value = serde_json::from_slice(&request.to_json().unwrap()).unwrap();

        assert_eq!(
            wire,
            json!({
                "headers": {"Authorization": "Bot tok", "Content-Type": "application/json"},
                "body": {"content": "hi"},
                "method": "POST",
                "path": "/api/v10/channels/42/messages"
            })
        );
    }

    #[test]
    fn test_debug_masks_authorization() {
        let request = RestRequest::create_message("42", "very-secret-token", "hi");
        let rendered = format!("{request:?}");
        assert!(!rendered.contains("very-secret-token"));
        assert!(rendered.contains("/api/v10/channels/42/messages"));
    }
}
