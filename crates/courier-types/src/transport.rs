//! The contract every transport backend implements.
//!
//! A [`Transport`] binds an id to a [`Connection`]. Inbound messages for that
//! id are handed to the [`InboundHandler`] given at connect time as
//! `(from, message)`.

use crate::config::TransportConfig;
use crate::error::CourierResult;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Callback invoked for every inbound message: `(from, message)`.
pub type InboundHandler = Arc<dyn Fn(String, Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Static description of a transport instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportInfo {
    /// Identity of this transport instance, unique per process.
    pub key: Uuid,
    /// Optional id used for `id@transportId` routing.
    pub id: Option<String>,
    /// Protocol discriminator, e.g. `local`, `mesh`, `http`.
    pub transport_type: String,
    /// Locality hint matched against `scheme://networkId/id`.
    pub network_id: Option<String>,
    /// Whether connections on this transport become the default.
    pub default: bool,
}

impl TransportInfo {
    /// Describe a fresh transport instance of the given type.
    pub fn new(transport_type: impl Into<String>) -> Self {
        Self {
            key: Uuid::new_v4(),
            id: None,
            transport_type: transport_type.into(),
            network_id: None,
            default: false,
        }
    }

    /// Describe a transport instance built from a configuration entry.
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            key: Uuid::new_v4(),
            id: config.id.clone(),
            transport_type: config.transport_type.clone(),
            network_id: config.network_id.clone(),
            default: config.default,
        }
    }

    /// Whether two descriptions refer to the same transport instance.
    pub fn same_instance(&self, other: &TransportInfo) -> bool {
        self.key == other.key
    }
}

/// A backend able to bind ids to connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Description of this transport.
    fn info(&self) -> &TransportInfo;

    /// Current network id. Transports whose network id is learned at
    /// runtime override this.
    fn network_id(&self) -> Option<String> {
        self.info().network_id.clone()
    }

    /// Bind `id` on this transport. `receive` is invoked for every message
    /// addressed to `id`.
    async fn connect(&self, id: &str, receive: InboundHandler)
        -> CourierResult<Arc<dyn Connection>>;

    /// Release every resource held by the transport. Idempotent.
    async fn close(&self) -> CourierResult<()>;
}

/// One id's live binding to a transport.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Description of the transport this connection belongs to.
    fn info(&self) -> &TransportInfo;

    /// The id this connection is bound to.
    fn local_id(&self) -> &str;

    /// Current network id of the underlying transport.
    fn network_id(&self) -> Option<String> {
        self.info().network_id.clone()
    }

    /// Deliver `message` to `to`.
    async fn send(&self, to: &str, message: Value) -> CourierResult<()>;

    /// Resolves once the backend registration has completed.
    async fn ready(&self) -> CourierResult<()>;

    /// Unbind. Idempotent.
    async fn close(&self) -> CourierResult<()>;
}
