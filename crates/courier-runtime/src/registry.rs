//! Transport registry: type constructors and loaded transport instances.

use crate::local::{LocalTransport, LOCAL_TRANSPORT};

use courier_types::{CourierError, CourierResult, Transport, TransportConfig};
use courier_wire::{Host, MeshTransport, MESH_TRANSPORT};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Builds a transport from its configuration entry.
pub type TransportFactory =
    Arc<dyn Fn(TransportConfig) -> BoxFuture<'static, CourierResult<Arc<dyn Transport>>> + Send + Sync>;

/// Maps `{ type, ... }` entries to transports and keeps the loaded ones.
///
/// At most one transport is kept per `(type, id)`.
#[derive(Default)]
pub struct TransportRegistry {
    types: HashMap<String, TransportFactory>,
    transports: RwLock<Vec<Arc<dyn Transport>>>,
}

impl TransportRegistry {
    /// A registry with no known types.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry knowing the `local` and `mesh` types.
    pub fn with_builtin_types() -> Self {
        let mut registry = Self::new();
        registry.register_type(LOCAL_TRANSPORT, |config| {
            async move { Ok(Arc::new(LocalTransport::new(&config)) as Arc<dyn Transport>) }.boxed()
        });
        registry.register_type(MESH_TRANSPORT, |config| {
            async move {
                let transport = MeshTransport::from_config(config).await?;
                Ok(Arc::new(transport) as Arc<dyn Transport>)
            }
            .boxed()
        });
        registry
    }

    /// Register a constructor for `name`, replacing any previous one.
    pub fn register_type<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(TransportConfig) -> BoxFuture<'static, CourierResult<Arc<dyn Transport>>>
            + Send
            + Sync
            + 'static,
    {
        self.types.insert(name.into(), Arc::new(factory));
    }

    /// Bind `mesh` entries to `host` instead of starting a host per entry.
    /// Their `listen` and `join` fields are ignored.
    pub fn share_mesh_host(&mut self, host: Host) {
        self.register_type(MESH_TRANSPORT, move |config| {
            let host = host.clone();
            async move {
                if config.extra.contains_key("listen") || config.extra.contains_key("join") {
                    warn!(id = ?config.id, "Mesh transport uses the node host, ignoring its listen/join");
                }
                Ok(Arc::new(MeshTransport::new(host, &config)) as Arc<dyn Transport>)
            }
            .boxed()
        });
    }

    /// Known type names, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build a transport from `config` and add it.
    pub async fn load(&self, config: TransportConfig) -> CourierResult<Arc<dyn Transport>> {
        let factory = self
            .types
            .get(&config.transport_type)
            .cloned()
            .ok_or_else(|| CourierError::UnknownTransportType {
                name: config.transport_type.clone(),
                known: self.types(),
            })?;
        self.check_unique(&config.transport_type, config.id.as_deref())?;

        let transport = factory(config).await?;
        self.add(Arc::clone(&transport))?;
        Ok(transport)
    }

    /// Load every entry, stopping at the first failure.
    pub async fn load_all(
        &self,
        configs: impl IntoIterator<Item = TransportConfig>,
    ) -> CourierResult<Vec<Arc<dyn Transport>>> {
        let mut loaded = Vec::new();
        for config in configs {
            loaded.push(self.load(config).await?);
        }
        Ok(loaded)
    }

    /// Add an already built transport.
    pub fn add(&self, transport: Arc<dyn Transport>) -> CourierResult<()> {
        let mut transports = self.transports.write().unwrap_or_else(|e| e.into_inner());
        let info = transport.info();
        if transports.iter().any(|t| {
            t.info().transport_type == info.transport_type && t.info().id == info.id
        }) {
            return Err(CourierError::DuplicateTransport {
                transport_type: info.transport_type.clone(),
                id: info.id.clone().unwrap_or_default(),
            });
        }
        info!(transport = %info.transport_type, id = ?info.id, "Transport registered");
        transports.push(transport);
        Ok(())
    }

    fn check_unique(&self, transport_type: &str, id: Option<&str>) -> CourierResult<()> {
        let duplicate = self
            .transports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|t| t.info().transport_type == transport_type && t.info().id.as_deref() == id);
        if duplicate {
            return Err(CourierError::DuplicateTransport {
                transport_type: transport_type.to_string(),
                id: id.unwrap_or_default().to_string(),
            });
        }
        Ok(())
    }

    /// The transport with this id. Fails when none or several match.
    pub fn get(&self, id: &str) -> CourierResult<Arc<dyn Transport>> {
        let transports = self.transports.read().unwrap_or_else(|e| e.into_inner());
        let mut matches = transports
            .iter()
            .filter(|t| t.info().id.as_deref() == Some(id));
        match (matches.next(), matches.next()) {
            (Some(found), None) => Ok(Arc::clone(found)),
            (Some(_), Some(_)) => Err(CourierError::AmbiguousTransport(id.to_string())),
            (None, _) => Err(CourierError::TransportNotFound(id.to_string())),
        }
    }

    /// All transports of a type.
    pub fn get_by_type(&self, transport_type: &str) -> Vec<Arc<dyn Transport>> {
        self.transports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|t| t.info().transport_type == transport_type)
            .cloned()
            .collect()
    }

    /// All transports, in load order.
    pub fn all(&self) -> Vec<Arc<dyn Transport>> {
        self.transports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Close and forget every transport.
    pub async fn clear(&self) -> CourierResult<()> {
        let transports: Vec<Arc<dyn Transport>> = {
            let mut guard = self.transports.write().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for transport in transports {
            if let Err(e) = transport.close().await {
                warn!(transport = %transport.info().transport_type, error = %e, "Failed to close transport");
            }
        }
        Ok(())
    }
}
