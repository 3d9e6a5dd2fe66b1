//! Content-based listener dispatch.

use crate::agent::Agent;
use crate::middleware::{Layer, Middleware, Next};

use async_trait::async_trait;
use courier_types::{CourierError, CourierResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, RwLock};

/// Listener callback: `(from, message) -> result`.
pub type PatternCallback =
    Arc<dyn Fn(String, Value) -> BoxFuture<'static, CourierResult<Value>> + Send + Sync>;

/// Wrap an async closure as a [`PatternCallback`].
pub fn callback<F, Fut>(f: F) -> PatternCallback
where
    F: Fn(String, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CourierResult<Value>> + Send + 'static,
{
    Arc::new(move |from, message| f(from, message).boxed())
}

/// What a listener matches against.
#[derive(Clone)]
pub enum Pattern {
    /// Any message for which the predicate holds.
    Predicate(Arc<dyn Fn(&Value) -> bool + Send + Sync>),
    /// String messages matching the expression.
    Regex(regex_lite::Regex),
    /// Messages equal to the value.
    Value(Value),
}

impl Pattern {
    /// A predicate pattern.
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Pattern::Predicate(Arc::new(f))
    }

    /// A regular-expression pattern.
    pub fn regex(expr: &str) -> CourierResult<Self> {
        regex_lite::Regex::new(expr)
            .map(Pattern::Regex)
            .map_err(|e| CourierError::Config(format!("Invalid pattern /{expr}/: {e}")))
    }

    /// Whether `message` matches.
    pub fn matches(&self, message: &Value) -> bool {
        match self {
            Pattern::Predicate(f) => f(message),
            Pattern::Regex(re) => message.as_str().is_some_and(|s| re.is_match(s)),
            Pattern::Value(v) => v == message,
        }
    }
}

/// Predicates compare by identity, expressions by source text.
impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Pattern::Predicate(a), Pattern::Predicate(b)) => Arc::ptr_eq(a, b),
            (Pattern::Regex(a), Pattern::Regex(b)) => a.as_str() == b.as_str(),
            (Pattern::Value(a), Pattern::Value(b)) => a == b,
            _ => false,
        }
    }
}

impl std::fmt::Debug for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pattern::Predicate(_) => f.write_str("Predicate(..)"),
            Pattern::Regex(re) => write!(f, "Regex(/{}/)", re.as_str()),
            Pattern::Value(v) => write!(f, "Value({v})"),
        }
    }
}

/// Options of the `pattern` module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PatternOptions {
    /// Stop at the first matching listener and return its result.
    #[serde(alias = "stop_propagation")]
    pub stop_propagation: bool,
}

#[derive(Clone)]
struct Listener {
    pattern: Pattern,
    callback: PatternCallback,
}

/// Ordered `(pattern, callback)` listeners tried against every message.
///
/// Without stop-propagation every matching listener runs and the rest of
/// the chain always runs too; its result wins when it has a handler.
pub struct PatternLayer {
    stop_propagation: bool,
    listeners: RwLock<Vec<Listener>>,
}

impl Default for PatternLayer {
    fn default() -> Self {
        Self::new(PatternOptions::default())
    }
}

impl PatternLayer {
    pub fn new(options: PatternOptions) -> Self {
        Self {
            stop_propagation: options.stop_propagation,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Append a listener.
    pub fn listen(&self, pattern: Pattern, callback: PatternCallback) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Listener { pattern, callback });
    }

    /// Remove the first listener registered with this pattern and this
    /// callback. Returns whether one was removed.
    pub fn unlisten(&self, pattern: &Pattern, callback: &PatternCallback) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        match listeners
            .iter()
            .position(|l| &l.pattern == pattern && Arc::ptr_eq(&l.callback, callback))
        {
            Some(index) => {
                listeners.remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Middleware for PatternLayer {
    fn name(&self) -> &'static str {
        "pattern"
    }

    fn layer(&self) -> Layer {
        Layer::Addressing
    }

    async fn handle(
        &self,
        _agent: &Agent,
        from: &str,
        message: Value,
        next: Next<'_>,
    ) -> CourierResult<Value> {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut last = None;
        for listener in listeners {
            if !listener.pattern.matches(&message) {
                continue;
            }
            let result = (listener.callback)(from.to_string(), message.clone()).await;
            if self.stop_propagation {
                return result;
            }
            last = Some(result);
        }

        match next.run(from, message).await {
            Err(CourierError::Unhandled) => last.unwrap_or(Err(CourierError::Unhandled)),
            delegated => delegated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recording(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> PatternCallback {
        let log = Arc::clone(log);
        callback(move |_from, _message| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(name);
                Ok(json!(name))
            }
        })
    }

    #[test]
    fn test_pattern_kinds() {
        assert!(Pattern::regex("^hel+o").unwrap().matches(&json!("hello")));
        assert!(!Pattern::regex("^hel+o").unwrap().matches(&json!({"hello": 1})));
        assert!(Pattern::Value(json!({"a": 1})).matches(&json!({"a": 1})));
        assert!(Pattern::predicate(|m| m.is_number()).matches(&json!(3)));
        assert!(Pattern::regex("(").is_err());
    }

    #[tokio::test]
    async fn test_stop_propagation_runs_first_match_only() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let layer = Arc::new(PatternLayer::new(PatternOptions {
            stop_propagation: true,
        }));
        layer.listen(Pattern::regex("^hi").unwrap(), recording(&log, "p1"));
        layer.listen(Pattern::Value(json!("hi there")), recording(&log, "p2"));

        let agent = Agent::new("a");
        agent.load_module(layer);
        agent.on_receive({
            let log = Arc::clone(&log);
            move |_from, _message| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push("delegate");
                    Ok(json!("delegate"))
                }
            }
        });

        let result = agent.receive("x", json!("hi there")).await.unwrap();
        assert_eq!(result, json!("p1"));
        assert_eq!(*log.lock().unwrap(), vec!["p1"]);
    }

    #[tokio::test]
    async fn test_all_matches_and_delegate_run_without_stop() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let layer = Arc::new(PatternLayer::default());
        layer.listen(Pattern::regex("^hi").unwrap(), recording(&log, "p1"));
        layer.listen(Pattern::Value(json!("hi there")), recording(&log, "p2"));

        let agent = Agent::new("a");
        agent.load_module(layer);
        agent.on_receive({
            let log = Arc::clone(&log);
            move |_from, _message| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push("delegate");
                    Ok(json!("delegate"))
                }
            }
        });

        let result = agent.receive("x", json!("hi there")).await.unwrap();
        assert_eq!(result, json!("delegate"));
        assert_eq!(*log.lock().unwrap(), vec!["p1", "p2", "delegate"]);
    }

    #[tokio::test]
    async fn test_listener_result_stands_without_delegate() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let layer = Arc::new(PatternLayer::default());
        layer.listen(Pattern::Value(json!(1)), recording(&log, "one"));

        let agent = Agent::new("a");
        agent.load_module(layer);
        assert_eq!(agent.receive("x", json!(1)).await.unwrap(), json!("one"));
        assert!(matches!(
            agent.receive("x", json!(2)).await,
            Err(CourierError::Unhandled)
        ));
    }

    #[test]
    fn test_unlisten_needs_same_pattern_and_callback() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let layer = PatternLayer::default();
        let cb = recording(&log, "a");
        let other = recording(&log, "b");
        layer.listen(Pattern::Value(json!("x")), Arc::clone(&cb));
        layer.listen(Pattern::Value(json!("x")), Arc::clone(&cb));

        assert!(!layer.unlisten(&Pattern::Value(json!("y")), &cb));
        assert!(!layer.unlisten(&Pattern::Value(json!("x")), &other));
        assert!(layer.unlisten(&Pattern::Value(json!("x")), &cb));
        assert_eq!(layer.len(), 1);
    }
}
