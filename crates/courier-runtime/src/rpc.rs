//! JSON-RPC 2.0 method calls over agent messages.

use crate::agent::{Agent, MethodFn};
use crate::correlation::{Completion, Correlator};
use crate::middleware::{Layer, Middleware, Next};

use async_trait::async_trait;
use courier_types::envelope::{prepare_call, rpc_error, rpc_id_key, rpc_result, RpcMessage};
use courier_types::{CourierError, CourierResult};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default time to wait for a call result.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_millis(1500);

/// Options of the `rpc` module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcOptions {
    /// Call timeout in milliseconds.
    #[serde(with = "courier_types::config::duration_ms")]
    pub timeout: Duration,
    /// Agent methods to expose, captured when the module is built.
    pub methods: Vec<String>,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_RPC_TIMEOUT,
            methods: Vec::new(),
        }
    }
}

/// The table of functions an agent exposes over RPC.
#[derive(Clone, Default)]
pub struct RpcFunctions {
    functions: HashMap<String, MethodFn>,
}

impl RpcFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the agent's methods named in `names`. Names the agent does
    /// not define are skipped; later method changes are not seen.
    pub fn from_agent<S: AsRef<str>>(agent: &Agent, names: &[S]) -> Self {
        let mut functions = Self::new();
        for name in names {
            let name = name.as_ref();
            match agent.method(name) {
                Some(method) => {
                    functions.functions.insert(name.to_string(), method);
                }
                None => debug!(agent = %agent.id(), method = %name, "No such agent method, not exposed"),
            }
        }
        functions
    }

    /// Expose `function` as `name`.
    pub fn with<F, Fut>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(Value, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CourierResult<Value>> + Send + 'static,
    {
        let function: MethodFn = Arc::new(move |params, from| function(params, from).boxed());
        self.functions.insert(name.into(), function);
        self
    }

    /// The function exposed as `name`.
    pub fn get(&self, name: &str) -> Option<&MethodFn> {
        self.functions.get(name)
    }

    /// Exposed names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Answers incoming calls from an [`RpcFunctions`] table and correlates
/// results of outgoing calls.
pub struct RpcLayer {
    functions: RpcFunctions,
    timeout: Duration,
    pending: Correlator,
}

impl Default for RpcLayer {
    fn default() -> Self {
        Self::new(RpcFunctions::new(), RpcOptions::default())
    }
}

impl RpcLayer {
    pub fn new(functions: RpcFunctions, options: RpcOptions) -> Self {
        Self {
            functions,
            timeout: options.timeout,
            pending: Correlator::new(),
        }
    }

    /// The exposed functions.
    pub fn functions(&self) -> &RpcFunctions {
        &self.functions
    }

    /// Call `message.method` on `to` and wait for the result.
    ///
    /// `message` is `{ method, params?, id? }`; the id is generated and
    /// `params` defaults to `{}`. Fails before sending when `method` is
    /// missing.
    pub async fn call(&self, agent: &Agent, to: &str, message: Value) -> CourierResult<Value> {
        let call = prepare_call(message)?;
        let key = rpc_id_key(&call["id"]);
        let rx = self.pending.register(key.clone(), self.timeout);
        if let Err(e) = agent.send(to, call).await {
            self.pending.cancel(&key);
            return Err(e);
        }
        debug!(agent = %agent.id(), to = %to, id = %key, "RPC call sent");
        Correlator::wait(rx).await
    }

    async fn invoke(&self, from: &str, method: &str, params: Value) -> Result<Value, String> {
        let Some(function) = self.functions.get(method) else {
            return Err(format!("Cannot find function: {method}"));
        };
        function(params, from.to_string())
            .await
            .map_err(|e| e.to_string())
    }

    async fn settle(&self, agent: &Agent, from: &str, id: &Value, outcome: CourierResult<Value>) {
        let key = rpc_id_key(id);
        match self.pending.complete(&key, outcome).await {
            Completion::Resolved => {}
            Completion::Late => debug!(agent = %agent.id(), from = %from, id = %key, "Ignoring late RPC reply"),
            Completion::Unknown => debug!(agent = %agent.id(), from = %from, id = %key, "Ignoring RPC reply for unknown call"),
        }
    }
}

#[async_trait]
impl Middleware for RpcLayer {
    fn name(&self) -> &'static str {
        "rpc"
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
        let Some(rpc) = RpcMessage::classify(&message) else {
            return next.run(from, message).await;
        };

        let reply = match rpc {
            RpcMessage::Call { id, method, params } => match self.invoke(from, &method, params).await {
                Ok(result) => rpc_result(id, result),
                Err(error) => {
                    warn!(agent = %agent.id(), from = %from, method = %method, error = %error, "RPC call failed");
                    rpc_error(id, error)
                }
            },
            RpcMessage::Result { id, result } => {
                self.settle(agent, from, &id, Ok(result)).await;
                return Ok(Value::Null);
            }
            RpcMessage::Error { id, error } => {
                let text = match error {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                self.settle(agent, from, &id, Err(CourierError::Remote(text))).await;
                return Ok(Value::Null);
            }
            RpcMessage::Malformed { id, raw } => {
                rpc_error(id, format!("No method or result defined. Message:{raw}"))
            }
        };
        agent.send(from, reply).await?;
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_from_agent_captures_named_methods() {
        let agent = Agent::new("a1");
        agent.define_method("add", |params, _from| async move {
            let a = params["a"].as_i64().unwrap_or(0);
            let b = params["b"].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        })
        .unwrap();
        agent
            .define_method("hidden", |_p, _f| async { Ok(Value::Null) })
            .unwrap();

        let functions = RpcFunctions::from_agent(&agent, &["add", "missing"]);
        assert_eq!(functions.names(), vec!["add"]);
        let add = functions.get("add").unwrap();
        assert_eq!(add(json!({"a": 2, "b": 3}), "x".into()).await.unwrap(), json!(5));
    }

    #[tokio::test]
    async fn test_invoke_reports_missing_function() {
        let layer = RpcLayer::new(
            RpcFunctions::new().with("fail", |_p, _f| async {
                Err(CourierError::Internal("broken".into()))
            }),
            RpcOptions::default(),
        );
        assert_eq!(
            layer.invoke("x", "ping", json!({})).await.unwrap_err(),
            "Cannot find function: ping"
        );
        assert_eq!(
            layer.invoke("x", "fail", json!({})).await.unwrap_err(),
            "Internal error: broken"
        );
    }

    #[tokio::test]
    async fn test_call_without_method_fails_before_sending() {
        let agent = Agent::new("a1");
        let layer = RpcLayer::default();
        assert!(matches!(
            layer.call(&agent, "a2", json!({"params": {}})).await,
            Err(CourierError::MissingMethod)
        ));
    }

    #[tokio::test]
    async fn test_non_rpc_messages_fall_through() {
        let agent = Agent::new("a1");
        agent.load_module(Arc::new(RpcLayer::default()));
        agent.on_receive(|_from, message| async move { Ok(message) });
        assert_eq!(agent.receive("x", json!({"method": "m"})).await.unwrap(), json!({"method": "m"}));
    }
}
