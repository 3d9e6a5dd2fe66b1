//! Peer: a local mailbox registered on a [`Host`](crate::Host).

use crate::host::HostInner;

use courier_types::{CourierError, CourierResult};
use serde_json::Value;
use std::sync::{Arc, RwLock, Weak};
use tracing::debug;

/// Callback receiving `(from, message)` for a peer.
pub type PeerListener = Arc<dyn Fn(String, Value) + Send + Sync>;

/// A local mailbox on a host.
///
/// Messages addressed to the peer's id, from this host or any linked host,
/// are handed to the single listener installed with [`Peer::on_message`].
pub struct Peer {
    id: String,
    host: Weak<HostInner>,
    listener: RwLock<Option<PeerListener>>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer").field("id", &self.id).finish()
    }
}

impl Peer {
    pub(crate) fn new(id: &str, host: Weak<HostInner>) -> Self {
        Self {
            id: id.to_string(),
            host,
            listener: RwLock::new(None),
        }
    }

    /// The peer id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Install the message listener, replacing any previous one.
    pub fn on_message<F>(&self, listener: F)
    where
        F: Fn(String, Value) + Send + Sync + 'static,
    {
        *self.listener.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(listener));
    }

    /// Remove the message listener.
    pub fn clear_listener(&self) {
        *self.listener.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Hand a message to the listener. Returns false when none is installed.
    pub(crate) fn deliver(&self, from: String, message: Value) -> bool {
        let listener = self
            .listener
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match listener {
            Some(listener) => {
                listener(from, message);
                true
            }
            None => {
                debug!(peer = %self.id, from = %from, "Dropping message: no listener");
                false
            }
        }
    }

    /// Send a message from this peer to `to`, wherever it lives.
    pub async fn send(&self, to: &str, message: Value) -> CourierResult<()> {
        let host = self.host.upgrade().ok_or(CourierError::ConnectionClosed)?;
        host.send(&self.id, to, message).await
    }
}
