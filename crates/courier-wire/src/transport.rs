//! `mesh` transport: binds agent ids to peers on a [`Host`].

use crate::host::Host;
use crate::peer::Peer;

use async_trait::async_trait;
use courier_types::{
    Connection, CourierError, CourierResult, HostConfig, InboundHandler, Transport,
    TransportConfig, TransportInfo,
};
use dashmap::DashMap;
use futures::channel::mpsc;
use futures::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::{debug, info};

/// Type name under which the transport registers.
pub const MESH_TRANSPORT: &str = "mesh";

/// Transport that delivers through a peer network host.
///
/// Type-specific configuration fields:
///
/// - `listen`: socket address the host listens on (`127.0.0.1:0` picks a port)
/// - `join`: list of host URLs to join after listening
pub struct MeshTransport {
    info: TransportInfo,
    host: Host,
    owns_host: bool,
    bound: DashMap<String, Arc<Peer>>,
}

impl MeshTransport {
    /// Wrap an existing host. Closing the transport leaves the host running.
    pub fn new(host: Host, config: &TransportConfig) -> Self {
        Self {
            info: TransportInfo::from_config(config),
            host,
            owns_host: false,
            bound: DashMap::new(),
        }
    }

    /// Start a dedicated host from a configuration entry: listen on
    /// `listen` if given, then join every URL in `join`.
    pub async fn from_config(config: TransportConfig) -> CourierResult<Self> {
        let host = Host::new(HostConfig {
            network_id: config.network_id.clone(),
            ..HostConfig::default()
        });
        if let Some(addr) = config.extra_str("listen") {
            host.listen(addr).await?;
        }
        let joins: Vec<String> = match config.extra.get("join") {
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                CourierError::Config(format!("mesh transport \"join\" must be a list: {e}"))
            })?,
            None => Vec::new(),
        };
        for url in &joins {
            host.join(url).await?;
        }
        info!(url = ?host.url(), joined = joins.len(), "Mesh transport ready");

        let mut transport = Self::new(host, &config);
        transport.owns_host = true;
        Ok(transport)
    }

    /// The underlying host.
    pub fn host(&self) -> &Host {
        &self.host
    }
}

#[async_trait]
impl Transport for MeshTransport {
    fn info(&self) -> &TransportInfo {
        &self.info
    }

    fn network_id(&self) -> Option<String> {
        self.info.network_id.clone().or_else(|| self.host.network_id())
    }

    async fn connect(
        &self,
        id: &str,
        receive: InboundHandler,
    ) -> CourierResult<Arc<dyn Connection>> {
        let peer = self.host.create(id)?;

        // Queue inbound messages so delivery stays in arrival order while
        // handlers that await replies on this same connection can overlap.
        let (tx, rx) = mpsc::unbounded::<(String, Value)>();
        peer.on_message(move |from, message| {
            let _ = tx.unbounded_send((from, message));
        });
        let task = tokio::spawn(
            rx.for_each_concurrent(None, move |(from, message)| receive(from, message)),
        );

        self.bound.insert(id.to_string(), Arc::clone(&peer));
        debug!(id = %id, "Bound mesh connection");
        Ok(Arc::new(MeshConnection {
            info: self.info.clone(),
            host: self.host.clone(),
            peer,
            dispatch: task.abort_handle(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> CourierResult<()> {
        let ids: Vec<String> = self.bound.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, peer)) = self.bound.remove(&id) {
                peer.clear_listener();
                self.host.remove(&id);
            }
        }
        if self.owns_host {
            self.host.close().await?;
        }
        Ok(())
    }
}

/// One agent id bound to a host peer.
pub struct MeshConnection {
    info: TransportInfo,
    host: Host,
    peer: Arc<Peer>,
    dispatch: AbortHandle,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for MeshConnection {
    fn info(&self) -> &TransportInfo {
        &self.info
    }

    fn local_id(&self) -> &str {
        self.peer.id()
    }

    fn network_id(&self) -> Option<String> {
        self.info.network_id.clone().or_else(|| self.host.network_id())
    }

    async fn send(&self, to: &str, message: Value) -> CourierResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CourierError::ConnectionClosed);
        }
        self.peer.send(to, message).await
    }

    async fn ready(&self) -> CourierResult<()> {
        if self.host.is_closed() {
            return Err(CourierError::ConnectionClosed);
        }
        Ok(())
    }

    async fn close(&self) -> CourierResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.peer.clear_listener();
        if let Some(current) = self.host.get(self.peer.id()) {
            if Arc::ptr_eq(&current, &self.peer) {
                self.host.remove(self.peer.id());
            }
        }
        self.dispatch.abort();
        Ok(())
    }
}
