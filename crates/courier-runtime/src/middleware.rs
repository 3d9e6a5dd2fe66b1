//! The inbound dispatch chain.
//!
//! Every message an agent receives runs through an ordered list of
//! [`Middleware`] and ends at the agent's receive handler. Each middleware
//! either consumes the message or passes it on through [`Next`].
//!
//! Chain order is decided by [`Layer`], not by load order: correlation
//! layers (request/reply, RPC) always run before addressing layers
//! (patterns), so envelopes are unwrapped before pattern matching. Within
//! one layer the most recently installed middleware runs first.

use crate::agent::Agent;

use async_trait::async_trait;
use courier_types::{CourierError, CourierResult};
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;

/// The agent's own receive handler, at the end of the chain.
pub type ReceiveHandler =
    Arc<dyn Fn(String, Value) -> BoxFuture<'static, CourierResult<Value>> + Send + Sync>;

/// Position of a middleware in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Layer {
    /// Unwraps correlated envelopes. Runs first.
    Correlation,
    /// Routes plain messages by content. Runs after correlation.
    Addressing,
}

/// One stage of the inbound dispatch chain.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name under which the middleware is exposed as an agent capability.
    fn name(&self) -> &'static str;

    /// Chain position.
    fn layer(&self) -> Layer;

    /// Handle an inbound message. Call `next.run(..)` to delegate.
    ///
    /// The returned value is the result of the receive; `Value::Null` means
    /// "no result".
    async fn handle(
        &self,
        agent: &Agent,
        from: &str,
        message: Value,
        next: Next<'_>,
    ) -> CourierResult<Value>;
}

/// The rest of the chain after the current middleware.
pub struct Next<'a> {
    agent: &'a Agent,
    chain: &'a [Arc<dyn Middleware>],
    terminal: Option<ReceiveHandler>,
}

impl<'a> Next<'a> {
    pub(crate) fn new(
        agent: &'a Agent,
        chain: &'a [Arc<dyn Middleware>],
        terminal: Option<ReceiveHandler>,
    ) -> Self {
        Self {
            agent,
            chain,
            terminal,
        }
    }

    /// Whether anything is left to delegate to.
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty() && self.terminal.is_none()
    }

    /// Run the remaining chain. Fails with [`CourierError::Unhandled`] when
    /// the chain ends without a receive handler.
    pub async fn run(self, from: &str, message: Value) -> CourierResult<Value> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                let next = Next::new(self.agent, rest, self.terminal);
                head.handle(self.agent, from, message, next).await
            }
            None => match self.terminal {
                Some(handler) => handler(from.to_string(), message).await,
                None => Err(CourierError::Unhandled),
            },
        }
    }
}

/// Insert `middleware` into `chain`, keeping layers ordered and putting it
/// ahead of existing middleware of the same layer.
pub(crate) fn insert_ordered(chain: &mut Vec<Arc<dyn Middleware>>, middleware: Arc<dyn Middleware>) {
    let layer = middleware.layer();
    let pos = chain
        .iter()
        .position(|m| m.layer() >= layer)
        .unwrap_or(chain.len());
    chain.insert(pos, middleware);
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;

    struct Tag {
        name: &'static str,
        layer: Layer,
    }

    #[async_trait]
    impl Middleware for Tag {
        fn name(&self) -> &'static str {
            self.name
        }

        fn layer(&self) -> Layer {
            self.layer
        }

        async fn handle(
            &self,
            _agent: &Agent,
            from: &str,
            message: Value,
            next: Next<'_>,
        ) -> CourierResult<Value> {
            let mut trail = message;
            if let Some(arr) = trail.as_array_mut() {
                arr.push(json!(self.name));
            }
            next.run(from, trail).await
        }
    }

    fn tag(name: &'static str, layer: Layer) -> Arc<dyn Middleware> {
        Arc::new(Tag { name, layer })
    }

    #[test]
    fn test_insert_orders_by_layer_then_recency() {
        let mut chain = Vec::new();
        insert_ordered(&mut chain, tag("pattern", Layer::Addressing));
        insert_ordered(&mut chain, tag("request", Layer::Correlation));
        insert_ordered(&mut chain, tag("rpc", Layer::Correlation));
        insert_ordered(&mut chain, tag("pattern2", Layer::Addressing));
        let names: Vec<_> = chain.iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["rpc", "request", "pattern2", "pattern"]);
    }

    #[tokio::test]
    async fn test_chain_runs_in_order_and_reaches_terminal() {
        let agent = Agent::new("a");
        let chain = vec![tag("first", Layer::Correlation), tag("second", Layer::Addressing)];
        let terminal: ReceiveHandler = Arc::new(|_from, message| async move { Ok(message) }.boxed());
        let result = Next::new(&agent, &chain, Some(terminal))
            .run("x", json!([]))
            .await
            .unwrap();
        assert_eq!(result, json!(["first", "second"]));
    }

    #[tokio::test]
    async fn test_chain_without_terminal_is_unhandled() {
        let agent = Agent::new("a");
        let chain = vec![tag("only", Layer::Addressing)];
        let next = Next::new(&agent, &chain, None);
        assert!(!next.is_empty());
        assert!(matches!(
            next.run("x", json!([])).await,
            Err(CourierError::Unhandled)
        ));
    }
}
