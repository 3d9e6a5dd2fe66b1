//! Message envelopes carried as the payload of an agent message.
//!
//! Two envelope families exist:
//!
//! - request/reply: `{ kind: "request", id, message }` for a call and
//!   `{ kind: "request", id, message }` / `{ kind: "request", id, error }`
//!   for the reply;
//! - JSON-RPC 2.0: `{ jsonrpc: "2.0", id, method, params }` for a call and
//!   `{ jsonrpc: "2.0", id, result }` / `{ jsonrpc: "2.0", id, error }` for
//!   the reply.

use crate::error::{CourierError, CourierResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Discriminator of request/reply envelopes.
pub const REQUEST_KIND: &str = "request";

/// JSON-RPC protocol version tag.
pub const JSONRPC_VERSION: &str = "2.0";

/// Generate a fresh correlation id.
pub fn correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Request / reply
// ---------------------------------------------------------------------------

/// A request or reply envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Always [`REQUEST_KIND`].
    pub kind: String,
    /// Correlation id shared by a request and its reply.
    pub id: String,
    /// The request payload, or the result of a successful reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    /// Error text of a failed reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RequestEnvelope {
    /// Wrap a payload into a request.
    pub fn request(id: impl Into<String>, message: Value) -> Self {
        Self {
            kind: REQUEST_KIND.to_string(),
            id: id.into(),
            message: Some(message),
            error: None,
        }
    }

    /// Build a successful reply.
    pub fn reply(id: impl Into<String>, result: Value) -> Self {
        Self::request(id, result)
    }

    /// Build a failed reply.
    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            kind: REQUEST_KIND.to_string(),
            id: id.into(),
            message: None,
            error: Some(error.into()),
        }
    }

    /// Recognise a request/reply envelope. Returns `None` for anything
    /// that is not an object tagged `kind: "request"` with a string id.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.get("kind").and_then(Value::as_str) != Some(REQUEST_KIND) {
            return None;
        }
        let id = obj.get("id")?.as_str()?.to_string();
        let error = obj.get("error").map(|e| match e {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        Some(Self {
            kind: REQUEST_KIND.to_string(),
            id,
            message: obj.get("message").cloned(),
            error,
        })
    }

    /// The carried result, or the carried error as a remote error.
    pub fn into_result(self) -> CourierResult<Value> {
        match self.error {
            Some(error) => Err(CourierError::Remote(error)),
            None => Ok(self.message.unwrap_or(Value::Null)),
        }
    }

    /// Serialize into a message payload.
    pub fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// JSON-RPC
// ---------------------------------------------------------------------------

/// An inbound JSON-RPC envelope, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    /// `{ method, params }`: a call to dispatch.
    Call {
        /// Call id, echoed in the reply.
        id: Value,
        /// Method name.
        method: String,
        /// Call parameters (`{}` when absent).
        params: Value,
    },
    /// `{ result }`: a successful reply.
    Result {
        /// Id of the call this answers.
        id: Value,
        /// The returned value.
        result: Value,
    },
    /// `{ error }`: a failed reply.
    Error {
        /// Id of the call this answers.
        id: Value,
        /// The error payload.
        error: Value,
    },
    /// Tagged `jsonrpc: "2.0"` but neither a call nor a reply.
    Malformed {
        /// Id to echo in the error reply.
        id: Value,
        /// The original envelope.
        raw: Value,
    },
}

impl RpcMessage {
    /// Classify a JSON-RPC envelope. Returns `None` when `value` is not an
    /// object tagged `jsonrpc: "2.0"`.
    pub fn classify(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return None;
        }
        let id = obj.get("id").cloned().unwrap_or(Value::Null);

        if let Some(method) = obj.get("method").and_then(Value::as_str) {
            let params = obj
                .get("params")
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new()));
            return Some(RpcMessage::Call {
                id,
                method: method.to_string(),
                params,
            });
        }
        // `result: null` is a valid result, so presence is what counts.
        if let Some(result) = obj.get("result") {
            return Some(RpcMessage::Result {
                id,
                result: result.clone(),
            });
        }
        if let Some(error) = obj.get("error") {
            return Some(RpcMessage::Error {
                id,
                error: error.clone(),
            });
        }
        Some(RpcMessage::Malformed {
            id,
            raw: value.clone(),
        })
    }
}

/// Complete an outgoing call envelope: tag `jsonrpc`, generate an `id` when
/// absent, default `params` to `{}`. Fails when `method` is missing.
pub fn prepare_call(message: Value) -> CourierResult<Value> {
    let Value::Object(mut obj) = message else {
        return Err(CourierError::InvalidMessage(
            "Message must be an object".to_string(),
        ));
    };
    if !obj.get("method").is_some_and(Value::is_string) {
        return Err(CourierError::MissingMethod);
    }
    obj.insert("jsonrpc".into(), Value::String(JSONRPC_VERSION.into()));
    if obj.get("id").map_or(true, Value::is_null) {
        obj.insert("id".into(), Value::String(correlation_id()));
    }
    if !obj.contains_key("params") {
        obj.insert("params".into(), Value::Object(Map::new()));
    }
    Ok(Value::Object(obj))
}

/// Correlation key for a JSON-RPC id of any JSON type.
pub fn rpc_id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Build a successful JSON-RPC reply.
pub fn rpc_result(id: Value, result: Value) -> Value {
    serde_json::json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result })
}

/// Build a failed JSON-RPC reply.
pub fn rpc_error(id: Value, error: impl Into<String>) -> Value {
    serde_json::json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "error": error.into() })
}
