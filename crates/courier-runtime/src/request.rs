//! Request/reply correlation over plain agent messages.
//!
//! A request travels as `{ kind: "request", id, message }`; the reply reuses
//! the id and carries either `message` (the result) or `error`.

use crate::agent::Agent;
use crate::correlation::{Completion, Correlator};
use crate::middleware::{Layer, Middleware, Next};

use async_trait::async_trait;
use courier_types::envelope::RequestEnvelope;
use courier_types::CourierResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Default time to wait for a reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Options of the `request` module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    /// Reply timeout in milliseconds.
    #[serde(with = "courier_types::config::duration_ms")]
    pub timeout: Duration,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Correlates outgoing requests with their replies and answers incoming
/// requests with the result of the rest of the chain.
pub struct RequestLayer {
    timeout: Duration,
    pending: Correlator,
}

impl Default for RequestLayer {
    fn default() -> Self {
        Self::new(RequestOptions::default())
    }
}

impl RequestLayer {
    pub fn new(options: RequestOptions) -> Self {
        Self {
            timeout: options.timeout,
            pending: Correlator::new(),
        }
    }

    /// The reply timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `message` to `to` as a request and wait for the reply.
    pub async fn request(&self, agent: &Agent, to: &str, message: Value) -> CourierResult<Value> {
        let id = self.pending.issue_id();
        let rx = self.pending.register(id.clone(), self.timeout);
        let envelope = RequestEnvelope::request(id.clone(), message).into_value();
        if let Err(e) = agent.send(to, envelope).await {
            self.pending.cancel(&id);
            return Err(e);
        }
        debug!(agent = %agent.id(), to = %to, id = %id, "Request sent");
        Correlator::wait(rx).await
    }
}

#[async_trait]
impl Middleware for RequestLayer {
    fn name(&self) -> &'static str {
        "request"
    }

    fn layer(&self) -> Layer {
        Layer::Correlation
    }

    async fn handle(
        &self,
        agent: &Agent,
        from: &str,
        message: Value,
        next: Next<'_>,
    ) -> CourierResult<Value> {
        let Some(envelope) = RequestEnvelope::from_value(&message) else {
            return next.run(from, message).await;
        };

        let id = envelope.id.clone();
        match self.pending.complete(&id, envelope.clone().into_result()).await {
            Completion::Resolved => return Ok(Value::Null),
            Completion::Late => {
                debug!(agent = %agent.id(), from = %from, id = %id, "Ignoring late reply");
                return Ok(Value::Null);
            }
            Completion::Unknown => {}
        }
        if envelope.error.is_some() {
            debug!(agent = %agent.id(), from = %from, id = %id, "Ignoring error reply for unknown request");
            return Ok(Value::Null);
        }

        let payload = envelope.message.unwrap_or(Value::Null);
        let reply = match next.run(from, payload).await {
            Ok(result) => RequestEnvelope::reply(id, result),
            Err(e) => {
                warn!(agent = %agent.id(), from = %from, error = %e, "Request handler failed");
                RequestEnvelope::failure(id, e.to_string())
            }
        };
        agent.send(from, reply.into_value()).await?;
        Ok(Value::Null)
    }
}
