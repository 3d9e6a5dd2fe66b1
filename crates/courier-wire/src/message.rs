//! Host-to-host link protocol message types.
//!
//! Hosts talk over TCP using JSON-framed messages. Each message is prefixed
//! with a 4-byte big-endian length header.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A link protocol message (envelope).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkMessage {
    /// Correlation id. Notifications carry `0`.
    #[serde(default)]
    pub id: u64,
    /// Message variant.
    #[serde(flatten)]
    pub kind: LinkMessageKind,
}

/// The different kinds of link messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LinkMessageKind {
    /// Request from one host to another.
    #[serde(rename = "request")]
    Request(LinkRequest),
    /// Response to a request.
    #[serde(rename = "response")]
    Response(LinkResponse),
    /// One-way notification (no response expected).
    #[serde(rename = "notification")]
    Notification(LinkNotification),
}

/// Request messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum LinkRequest {
    /// First message on a new link: introduce the calling host.
    #[serde(rename = "greeting")]
    Greeting {
        /// URL the calling host listens on.
        url: String,
        /// Network the calling host belongs to, if known yet.
        #[serde(rename = "networkId", default)]
        network_id: Option<String>,
    },
    /// List the hosts the remote is linked to.
    #[serde(rename = "hosts")]
    Hosts,
    /// Ask whether a peer lives on the remote host.
    #[serde(rename = "find")]
    Find {
        /// Peer id.
        id: String,
    },
    /// Deliver a message to a peer on the remote host.
    #[serde(rename = "send")]
    Send {
        /// Sending peer id.
        from: String,
        /// Receiving peer id.
        to: String,
        /// Payload.
        message: Value,
    },
    /// Liveness probe; the payload is echoed back.
    #[serde(rename = "ping")]
    Ping {
        /// Arbitrary payload.
        #[serde(default)]
        data: Value,
    },
}

impl LinkRequest {
    /// Method name, for logging.
    pub fn method(&self) -> &'static str {
        match self {
            LinkRequest::Greeting { .. } => "greeting",
            LinkRequest::Hosts => "hosts",
            LinkRequest::Find { .. } => "find",
            LinkRequest::Send { .. } => "send",
            LinkRequest::Ping { .. } => "ping",
        }
    }
}

/// Response messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome")]
pub enum LinkResponse {
    /// The request succeeded.
    #[serde(rename = "success")]
    Success {
        /// Method-specific result.
        #[serde(default)]
        result: Value,
    },
    /// The request failed.
    #[serde(rename = "error")]
    Error(LinkError),
}

/// Error body of a failed link request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkError {
    /// Error code (HTTP-like: 400, 401, 403, 404, 503).
    pub code: u16,
    /// Human-readable message.
    pub message: String,
    /// Structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl LinkError {
    /// Build an error without detail.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured detail.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Notification messages (one-way, no response).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum LinkNotification {
    /// A host joined the network; the receiver should link to it.
    #[serde(rename = "join")]
    Join {
        /// URL of the new host.
        url: String,
    },
    /// The sender is shutting down on purpose.
    #[serde(rename = "goodbye")]
    Goodbye,
    /// A message published on a channel.
    #[serde(rename = "publish")]
    Publish {
        /// Channel name.
        channel: String,
        /// Payload.
        message: Value,
    },
}

/// Encode a link message to bytes (4-byte big-endian length + JSON).
pub fn encode_message(msg: &LinkMessage) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a LinkMessage.
pub fn decode_message(body: &[u8]) -> Result<LinkMessage, serde_json::Error> {
    serde_json::from_slice(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_length_prefix() {
        let msg = LinkMessage {
            id: 1,
            kind: LinkMessageKind::Request(LinkRequest::Hosts),
        };
        let bytes = encode_message(&msg).unwrap();
        let len = decode_length(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        assert_eq!(decode_message(&bytes[4..]).unwrap(), msg);
    }

    #[test]
    fn test_greeting_wire_shape() {
        let msg = LinkMessage {
            id: 7,
            kind: LinkMessageKind::Request(LinkRequest::Greeting {
                url: "tcp://127.0.0.1:4000".to_string(),
                network_id: Some("net".to_string()),
            }),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "id": 7,
                "type": "request",
                "method": "greeting",
                "url": "tcp://127.0.0.1:4000",
                "networkId": "net"
            })
        );
    }

    #[test]
    fn test_notification_without_id() {
        let decoded: LinkMessage =
            serde_json::from_value(json!({"type": "notification", "method": "goodbye"})).unwrap();
        assert_eq!(decoded.id, 0);
        assert_eq!(
            decoded.kind,
            LinkMessageKind::Notification(LinkNotification::Goodbye)
        );
    }

    #[test]
    fn test_error_response_with_data() {
        let msg = LinkMessage {
            id: 3,
            kind: LinkMessageKind::Response(LinkResponse::Error(
                LinkError::new(403, "Network id mismatch").with_data(json!({"networkId": "a"})),
            )),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let decoded: LinkMessage = serde_json::from_str(&json).unwrap();
        match decoded.kind {
            LinkMessageKind::Response(LinkResponse::Error(err)) => {
                assert_eq!(err.code, 403);
                assert_eq!(err.data, Some(json!({"networkId": "a"})));
            }
            other => panic!("Expected Error, got {other:?}"),
        }
    }

    #[test]
    fn test_null_result_survives() {
        let msg = LinkMessage {
            id: 9,
            kind: LinkMessageKind::Response(LinkResponse::Success {
                result: Value::Null,
            }),
        };
        let bytes = encode_message(&msg).unwrap();
        assert_eq!(decode_message(&bytes[4..]).unwrap(), msg);
    }
}
