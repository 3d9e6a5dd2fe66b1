//! Modules: middleware that can also be exposed as an agent capability,
//! and the registry that builds them by name.

use crate::agent::Agent;
use crate::middleware::Middleware;
use crate::pattern::{PatternLayer, PatternOptions};
use crate::request::{RequestLayer, RequestOptions};
use crate::rpc::{RpcFunctions, RpcLayer, RpcOptions};

use courier_types::{CourierError, CourierResult};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A middleware that can be installed with [`Agent::load_module`] or
/// [`Agent::extend`].
pub trait Module: Middleware {
    /// View as a capability object for [`Agent::capability`].
    fn into_capability(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// View as a chain stage.
    fn into_middleware(self: Arc<Self>) -> Arc<dyn Middleware>;
}

impl<T: Middleware + 'static> Module for T {
    fn into_capability(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn into_middleware(self: Arc<Self>) -> Arc<dyn Middleware> {
        self
    }
}

/// Builds a module for an agent from JSON options.
pub type ModuleFactory =
    Arc<dyn Fn(&Agent, &Value) -> CourierResult<Arc<dyn Module>> + Send + Sync>;

/// Name → module constructor table.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
}

impl ModuleRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the `pattern`, `request` and `rpc` modules.
    pub fn with_builtin_modules() -> Self {
        let mut registry = Self::new();
        registry.register("pattern", |_agent, options| {
            let options: PatternOptions = parse_options("pattern", options)?;
            Ok(Arc::new(PatternLayer::new(options)) as Arc<dyn Module>)
        });
        registry.register("request", |_agent, options| {
            let options: RequestOptions = parse_options("request", options)?;
            Ok(Arc::new(RequestLayer::new(options)) as Arc<dyn Module>)
        });
        registry.register("rpc", |agent, options| {
            let options: RpcOptions = parse_options("rpc", options)?;
            let functions = RpcFunctions::from_agent(agent, options.methods.as_slice());
            Ok(Arc::new(RpcLayer::new(functions, options)) as Arc<dyn Module>)
        });
        registry
    }

    /// Register a module constructor under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Agent, &Value) -> CourierResult<Arc<dyn Module>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Registered module names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build the module `name` for `agent`.
    pub fn create(&self, agent: &Agent, name: &str, options: &Value) -> CourierResult<Arc<dyn Module>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| CourierError::UnknownModule {
                name: name.to_string(),
                known: self.names(),
            })?;
        factory(agent, options)
    }

    /// Build `name` and install only its receive stage.
    pub fn load(&self, agent: &Agent, name: &str, options: &Value) -> CourierResult<Arc<dyn Module>> {
        let module = self.create(agent, name, options)?;
        agent.load_module(Arc::clone(&module));
        debug!(agent = %agent.id(), module = %name, "Module loaded");
        Ok(module)
    }

    /// Build `name` and install it as a capability.
    pub fn extend(&self, agent: &Agent, name: &str, options: &Value) -> CourierResult<Arc<dyn Module>> {
        let module = self.create(agent, name, options)?;
        agent.extend(Arc::clone(&module))?;
        Ok(module)
    }
}

fn parse_options<T: DeserializeOwned + Default>(module: &str, options: &Value) -> CourierResult<T> {
    if options.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(options.clone())
        .map_err(|e| CourierError::Config(format!("Invalid options for module \"{module}\": {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_unknown_module_lists_known() {
        let registry = ModuleRegistry::with_builtin_modules();
        let agent = Agent::new("a1");
        let err = registry.create(&agent, "telepathy", &Value::Null).err().unwrap();
        assert_eq!(
            err.to_string(),
            "Unknown module \"telepathy\". Choose from: pattern,request,rpc"
        );
    }

    #[test]
    fn test_extend_by_name_exposes_capability() {
        let registry = ModuleRegistry::with_builtin_modules();
        let agent = Agent::new("a1");
        registry
            .extend(&agent, "request", &json!({"timeout": 250}))
            .unwrap();
        let layer = agent.capability::<RequestLayer>().unwrap();
        assert_eq!(layer.timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_load_by_name_keeps_capabilities_empty() {
        let registry = ModuleRegistry::with_builtin_modules();
        let agent = Agent::new("a1");
        registry.load(&agent, "pattern", &Value::Null).unwrap();
        registry.load(&agent, "rpc", &Value::Null).unwrap();
        assert!(agent.capabilities().is_empty());
        assert_eq!(agent.chain(), vec!["rpc", "pattern"]);
    }

    #[test]
    fn test_bad_options_are_a_config_error() {
        let registry = ModuleRegistry::with_builtin_modules();
        let agent = Agent::new("a1");
        assert!(matches!(
            registry.create(&agent, "request", &json!({"timeout": "soon"})),
            Err(CourierError::Config(_))
        ));
    }
}
