//! Agent: an addressable actor bound to one or more transports.

use crate::middleware::{insert_ordered, Middleware, Next, ReceiveHandler};
use crate::module::Module;
use crate::pattern::{Pattern, PatternCallback, PatternLayer};
use crate::request::RequestLayer;
use crate::rpc::RpcLayer;

use courier_types::{Address, Connection, CourierError, CourierResult, InboundHandler, Transport};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// A named agent method: `(params, from) -> result`.
pub type MethodFn =
    Arc<dyn Fn(Value, String) -> BoxFuture<'static, CourierResult<Value>> + Send + Sync>;

/// An addressable actor.
///
/// Cloning an `Agent` yields another handle to the same actor.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    id: String,
    connections: RwLock<Vec<Arc<dyn Connection>>>,
    default: RwLock<Option<Arc<dyn Connection>>>,
    chain: RwLock<Arc<Vec<Arc<dyn Middleware>>>>,
    handler: RwLock<Option<ReceiveHandler>>,
    capabilities: DashMap<&'static str, Arc<dyn Any + Send + Sync>>,
    methods: DashMap<String, MethodFn>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent").field("id", &self.inner.id).finish()
    }
}

impl Agent {
    /// Create an agent with no connections.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(AgentInner {
                id: id.into(),
                connections: RwLock::new(Vec::new()),
                default: RwLock::new(None),
                chain: RwLock::new(Arc::new(Vec::new())),
                handler: RwLock::new(None),
                capabilities: DashMap::new(),
                methods: DashMap::new(),
            }),
        }
    }

    /// The agent id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Bind the agent to `transport` under its own id.
    pub async fn connect(&self, transport: &Arc<dyn Transport>) -> CourierResult<Arc<dyn Connection>> {
        let id = self.inner.id.clone();
        self.connect_as(transport, &id).await
    }

    /// Bind the agent to `transport` under `local_id`.
    ///
    /// Connecting to a transport the agent is already bound to returns the
    /// existing connection. Connections on a transport flagged `default`
    /// replace a non-flagged default; a second flagged default is refused.
    pub async fn connect_as(
        &self,
        transport: &Arc<dyn Transport>,
        local_id: &str,
    ) -> CourierResult<Arc<dyn Connection>> {
        let info = transport.info();
        if let Some(existing) = self.connection_for(transport.as_ref()) {
            return Ok(existing);
        }
        if info.default && self.default_is_flagged() {
            return Err(CourierError::DuplicateDefault);
        }

        let weak = Arc::downgrade(&self.inner);
        let receive: InboundHandler = Arc::new(move |from, message| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    Agent { inner }.dispatch(from, message).await;
                }
            }
            .boxed()
        });
        let connection = transport.connect(local_id, receive).await?;

        {
            let mut connections = self.inner.connections.write().unwrap_or_else(|e| e.into_inner());
            connections.push(Arc::clone(&connection));
        }
        {
            let mut default = self.inner.default.write().unwrap_or_else(|e| e.into_inner());
            let replace = match default.as_ref() {
                None => true,
                Some(current) => info.default && !current.info().default,
            };
            if replace {
                *default = Some(Arc::clone(&connection));
            }
        }
        info!(agent = %self.inner.id, transport = %info.transport_type, id = ?info.id, "Agent connected");
        Ok(connection)
    }

    /// Close the connections to the given transports.
    pub async fn disconnect(&self, transports: &[Arc<dyn Transport>]) -> CourierResult<()> {
        let removed: Vec<Arc<dyn Connection>> = {
            let mut connections = self.inner.connections.write().unwrap_or_else(|e| e.into_inner());
            let (gone, kept): (Vec<_>, Vec<_>) = connections.drain(..).partition(|c| {
                transports
                    .iter()
                    .any(|t| c.info().same_instance(t.info()))
            });
            *connections = kept;
            gone
        };
        self.close_removed(removed).await
    }

    /// Close every connection.
    pub async fn disconnect_all(&self) -> CourierResult<()> {
        let removed: Vec<Arc<dyn Connection>> = {
            let mut connections = self.inner.connections.write().unwrap_or_else(|e| e.into_inner());
            connections.drain(..).collect()
        };
        self.close_removed(removed).await
    }

    async fn close_removed(&self, removed: Vec<Arc<dyn Connection>>) -> CourierResult<()> {
        self.rederive_default();
        let mut first_err = None;
        for connection in removed {
            debug!(agent = %self.inner.id, transport = %connection.info().transport_type, "Closing connection");
            if let Err(e) = connection.close().await {
                warn!(agent = %self.inner.id, error = %e, "Failed to close connection");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Pick the default again from the remaining connections: the first
    /// flagged one, else the first one, else none.
    fn rederive_default(&self) {
        let connections = self.connections();
        let next = connections
            .iter()
            .find(|c| c.info().default)
            .or_else(|| connections.first())
            .cloned();
        *self.inner.default.write().unwrap_or_else(|e| e.into_inner()) = next;
    }

    /// Current connections, in binding order.
    pub fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.inner
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The default connection, if any.
    pub fn default_connection(&self) -> Option<Arc<dyn Connection>> {
        self.inner
            .default
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn default_is_flagged(&self) -> bool {
        self.default_connection()
            .map(|c| c.info().default)
            .unwrap_or(false)
    }

    fn connection_for(&self, transport: &dyn Transport) -> Option<Arc<dyn Connection>> {
        self.find_connection(|c| c.info().same_instance(transport.info()))
    }

    fn find_connection<F>(&self, pred: F) -> Option<Arc<dyn Connection>>
    where
        F: Fn(&Arc<dyn Connection>) -> bool,
    {
        self.inner
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|c| pred(c))
            .cloned()
    }

    /// Resolve once every connection is ready.
    pub async fn ready(&self) -> CourierResult<()> {
        let connections = self.connections();
        futures::future::try_join_all(connections.iter().map(|c| c.ready())).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Send `message` to `to`.
    ///
    /// `to` is one of `scheme://network-or-domain/id`, `id@transportId` or a
    /// bare id; see [`Address`].
    pub async fn send(&self, to: &str, message: Value) -> CourierResult<()> {
        let (connection, dest) = match Address::parse(to) {
            Address::Protocol { scheme, url } => {
                let connection = self
                    .find_connection(|c| c.info().transport_type == scheme)
                    .ok_or(CourierError::ProtocolNotFound(scheme))?;
                (connection, url)
            }
            Address::Network { network_id, id } => {
                let connection = self
                    .find_connection(|c| c.network_id().as_deref() == Some(network_id.as_str()))
                    .ok_or(CourierError::NetworkNotFound(network_id))?;
                (connection, id)
            }
            Address::Transport { id, transport_id } => {
                let connection = self
                    .find_connection(|c| c.info().id.as_deref() == Some(transport_id.as_str()))
                    .ok_or(CourierError::TransportNotFound(transport_id))?;
                (connection, id)
            }
            Address::Local(id) => {
                let connection = self.default_connection().ok_or(CourierError::NoTransport)?;
                (connection, id)
            }
        };
        debug!(agent = %self.inner.id, to = %dest, transport = %connection.info().transport_type, "Sending message");
        connection.send(&dest, message).await
    }

    // -----------------------------------------------------------------------
    // Receiving
    // -----------------------------------------------------------------------

    /// Install the receive handler at the end of the dispatch chain,
    /// replacing any previous one.
    pub fn on_receive<F, Fut>(&self, handler: F)
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CourierResult<Value>> + Send + 'static,
    {
        let handler: ReceiveHandler = Arc::new(move |from, message| handler(from, message).boxed());
        *self.inner.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Run `message` through the dispatch chain and return its result.
    pub async fn receive(&self, from: &str, message: Value) -> CourierResult<Value> {
        let chain = self.inner.chain.read().unwrap_or_else(|e| e.into_inner()).clone();
        let terminal = self.inner.handler.read().unwrap_or_else(|e| e.into_inner()).clone();
        Next::new(self, &chain, terminal).run(from, message).await
    }

    /// Entry point for inbound transport deliveries. Errors stop here.
    async fn dispatch(&self, from: String, message: Value) {
        match self.receive(&from, message).await {
            Ok(_) => {}
            Err(CourierError::Unhandled) => {
                debug!(agent = %self.inner.id, from = %from, "Message not handled");
            }
            Err(e) => {
                warn!(agent = %self.inner.id, from = %from, error = %e, "Receive failed");
            }
        }
    }

    /// Insert a middleware into the dispatch chain.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        let mut chain = self.inner.chain.write().unwrap_or_else(|e| e.into_inner());
        let mut next = chain.as_ref().clone();
        insert_ordered(&mut next, middleware);
        *chain = Arc::new(next);
    }

    /// Names of the middleware in the chain, in dispatch order.
    pub fn chain(&self) -> Vec<&'static str> {
        self.inner
            .chain
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|m| m.name())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Modules and capabilities
    // -----------------------------------------------------------------------

    /// Install a module's receive stage without exposing it as a
    /// capability.
    pub fn load_module(&self, module: Arc<dyn Module>) {
        debug!(agent = %self.inner.id, module = module.name(), "Loading module");
        self.use_middleware(module.into_middleware());
    }

    /// Install a module and expose it as a capability under its name.
    /// Fails when the agent already has a capability or method of that name.
    pub fn extend(&self, module: Arc<dyn Module>) -> CourierResult<()> {
        let name = module.name();
        if self.inner.methods.contains_key(name) {
            return Err(CourierError::NameCollision(name.to_string()));
        }
        match self.inner.capabilities.entry(name) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(CourierError::NameCollision(name.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&module).into_capability());
            }
        }
        debug!(agent = %self.inner.id, module = name, "Extending agent");
        self.use_middleware(module.into_middleware());
        Ok(())
    }

    /// The installed capability of type `M`, if any.
    pub fn capability<M: Any + Send + Sync>(&self) -> Option<Arc<M>> {
        self.inner
            .capabilities
            .iter()
            .find_map(|entry| Arc::clone(entry.value()).downcast::<M>().ok())
    }

    /// Names of the installed capabilities.
    pub fn capabilities(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.inner.capabilities.iter().map(|e| *e.key()).collect();
        names.sort_unstable();
        names
    }

    /// Send a correlated request through the `request` capability.
    pub async fn request(&self, to: &str, message: Value) -> CourierResult<Value> {
        let layer = self
            .capability::<RequestLayer>()
            .ok_or(CourierError::MissingCapability("request"))?;
        layer.request(self, to, message).await
    }

    /// Make an RPC call through the `rpc` capability.
    pub async fn rpc_call(&self, to: &str, message: Value) -> CourierResult<Value> {
        let layer = self
            .capability::<RpcLayer>()
            .ok_or(CourierError::MissingCapability("rpc"))?;
        layer.call(self, to, message).await
    }

    /// Register a pattern listener through the `pattern` capability.
    pub fn listen(&self, pattern: Pattern, callback: PatternCallback) -> CourierResult<()> {
        let layer = self
            .capability::<PatternLayer>()
            .ok_or(CourierError::MissingCapability("pattern"))?;
        layer.listen(pattern, callback);
        Ok(())
    }

    /// Remove a pattern listener through the `pattern` capability.
    pub fn unlisten(&self, pattern: &Pattern, callback: &PatternCallback) -> CourierResult<bool> {
        let layer = self
            .capability::<PatternLayer>()
            .ok_or(CourierError::MissingCapability("pattern"))?;
        Ok(layer.unlisten(pattern, callback))
    }

    // -----------------------------------------------------------------------
    // Methods
    // -----------------------------------------------------------------------

    /// Define a named method, replacing any previous method of that name.
    /// Fails when a capability already uses the name.
    pub fn define_method<F, Fut>(&self, name: impl Into<String>, method: F) -> CourierResult<()>
    where
        F: Fn(Value, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CourierResult<Value>> + Send + 'static,
    {
        let name = name.into();
        if self.inner.capabilities.contains_key(name.as_str()) {
            return Err(CourierError::NameCollision(name));
        }
        let method: MethodFn = Arc::new(move |params, from| method(params, from).boxed());
        self.inner.methods.insert(name, method);
        Ok(())
    }

    /// A named method, if defined.
    pub fn method(&self, name: &str) -> Option<MethodFn> {
        self.inner.methods.get(name).map(|m| Arc::clone(m.value()))
    }
}
