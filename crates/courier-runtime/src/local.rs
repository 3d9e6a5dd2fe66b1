//! `local` transport: in-process delivery between agents.

use async_trait::async_trait;
use courier_types::{
    Connection, CourierError, CourierResult, InboundHandler, Transport, TransportConfig,
    TransportInfo,
};
use dashmap::DashMap;
use futures::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

/// Type name under which the transport registers.
pub const LOCAL_TRANSPORT: &str = "local";

type Inbox = mpsc::UnboundedSender<(String, Value)>;

/// Transport delivering through in-memory queues, one per bound id.
pub struct LocalTransport {
    info: TransportInfo,
    agents: Arc<DashMap<String, Inbox>>,
}

impl LocalTransport {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            info: TransportInfo::from_config(config),
            agents: Arc::new(DashMap::new()),
        }
    }

    /// Ids currently bound.
    pub fn bound(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new(&TransportConfig::new(LOCAL_TRANSPORT))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn info(&self) -> &TransportInfo {
        &self.info
    }

    async fn connect(&self, id: &str, receive: InboundHandler) -> CourierResult<Arc<dyn Connection>> {
        let (tx, rx) = mpsc::unbounded_channel::<(String, Value)>();
        match self.agents.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(CourierError::PeerExists(id.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx.clone());
            }
        }

        // Deliveries start in queue order; a handler awaiting a reply on
        // this same connection does not block the ones after it.
        let task = tokio::spawn(
            UnboundedReceiverStream::new(rx)
                .for_each_concurrent(None, move |(from, message)| receive(from, message)),
        );
        debug!(id = %id, "Bound local connection");

        Ok(Arc::new(LocalConnection {
            info: self.info.clone(),
            id: id.to_string(),
            inbox: tx,
            agents: Arc::clone(&self.agents),
            dispatch: task.abort_handle(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> CourierResult<()> {
        self.agents.clear();
        Ok(())
    }
}

/// One id bound on a [`LocalTransport`].
pub struct LocalConnection {
    info: TransportInfo,
    id: String,
    inbox: Inbox,
    agents: Arc<DashMap<String, Inbox>>,
    dispatch: AbortHandle,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for LocalConnection {
    fn info(&self) -> &TransportInfo {
        &self.info
    }

    fn local_id(&self) -> &str {
        &self.id
    }

    async fn send(&self, to: &str, message: Value) -> CourierResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CourierError::ConnectionClosed);
        }
        let inbox = self
            .agents
            .get(to)
            .map(|e| e.value().clone())
            .ok_or_else(|| CourierError::AgentNotFound(to.to_string()))?;
        inbox
            .send((self.id.clone(), message))
            .map_err(|_| CourierError::AgentNotFound(to.to_string()))
    }

    async fn ready(&self) -> CourierResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CourierError::ConnectionClosed);
        }
        Ok(())
    }

    async fn close(&self) -> CourierResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.agents
            .remove_if(&self.id, |_, inbox| inbox.same_channel(&self.inbox));
        self.dispatch.abort();
        debug!(id = %self.id, "Closed local connection");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;
    use std::time::Duration;

    fn recorder() -> (InboundHandler, mpsc::UnboundedReceiver<(String, Value)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: InboundHandler = Arc::new(move |from, message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((from, message));
            }
            .boxed()
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn test_delivers_in_send_order() {
        let transport = LocalTransport::default();
        let (h1, _) = recorder();
        let (h2, mut rx2) = recorder();
        let a1 = transport.connect("a1", h1).await.unwrap();
        transport.connect("a2", h2).await.unwrap();

        for n in 0..10 {
            a1.send("a2", json!(n)).await.unwrap();
        }
        for n in 0..10 {
            let (from, message) = tokio::time::timeout(Duration::from_secs(1), rx2.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(from, "a1");
            assert_eq!(message, json!(n));
        }
    }

    #[tokio::test]
    async fn test_unbound_destination_is_not_found() {
        let transport = LocalTransport::default();
        let (h1, _) = recorder();
        let a1 = transport.connect("a1", h1).await.unwrap();
        let err = a1.send("ghost", json!(1)).await.unwrap_err();
        assert_eq!(err.to_string(), "Agent with id ghost not found");
    }

    #[tokio::test]
    async fn test_close_unbinds_and_rejects_sends() {
        let transport = LocalTransport::default();
        let (h1, _) = recorder();
        let (h2, _) = recorder();
        let a1 = transport.connect("a1", h1).await.unwrap();
        let a2 = transport.connect("a2", h2).await.unwrap();

        a2.close().await.unwrap();
        assert_eq!(transport.bound(), vec!["a1".to_string()]);
        assert!(matches!(
            a1.send("a2", json!(1)).await,
            Err(CourierError::AgentNotFound(_))
        ));
        assert!(matches!(
            a2.send("a1", json!(1)).await,
            Err(CourierError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let transport = LocalTransport::default();
        let (h1, _) = recorder();
        let (h2, _) = recorder();
        transport.connect("a1", h1).await.unwrap();
        assert!(matches!(
            transport.connect("a1", h2).await,
            Err(CourierError::PeerExists(_))
        ));
    }
}
