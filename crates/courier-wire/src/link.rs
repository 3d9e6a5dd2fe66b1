//! A single host-to-host TCP link.
//!
//! Each [`Link`] owns a writer task fed by an unbounded queue and a reader
//! task that routes responses to pending requests and hands requests and
//! notifications to the owning host through [`LinkHandler`].

use crate::message::*;

use chrono::{DateTime, Utc};
use courier_types::CourierError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Errors from the framing layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
}

impl From<WireError> for CourierError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Io(e) => CourierError::Io(e),
            WireError::Json(e) => CourierError::Serialization(e),
            WireError::ConnectionClosed => CourierError::ConnectionClosed,
            other => CourierError::Link(other.to_string()),
        }
    }
}

/// Maximum single message size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Write a framed message (4-byte length + JSON) to a TCP stream.
pub async fn write_message(
    writer: &mut OwnedWriteHalf,
    msg: &LinkMessage,
) -> Result<(), WireError> {
    let bytes = encode_message(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed message (4-byte length + JSON) from a TCP stream.
pub async fn read_message(reader: &mut OwnedReadHalf) -> Result<LinkMessage, WireError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    let msg = decode_message(&body)?;
    Ok(msg)
}

/// Which side opened the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOrigin {
    /// This host dialed the remote.
    Outbound,
    /// The remote dialed this host.
    Inbound,
}

/// Snapshot of a live link, for introspection.
#[derive(Debug, Clone)]
pub struct LinkInfo {
    /// URL of the remote host.
    pub url: String,
    /// Which side opened the link.
    pub origin: LinkOrigin,
    /// When the link was established.
    pub connected_at: DateTime<Utc>,
}

/// Callbacks from a link into its owning host.
pub(crate) trait LinkHandler: Send + Sync + 'static {
    /// Answer a request received on `link`.
    fn on_request(&self, link: &Arc<Link>, request: LinkRequest) -> LinkResponse;

    /// Process a notification received on `link`.
    fn on_notification(&self, link: &Arc<Link>, notification: LinkNotification);

    /// The link's reader stopped.
    fn on_closed(&self, link: &Arc<Link>);
}

enum Outgoing {
    Frame(LinkMessage),
    Shutdown,
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, LinkError>>>;

/// A live link to one remote host.
pub struct Link {
    origin: LinkOrigin,
    remote: Mutex<Option<String>>,
    outbox: mpsc::UnboundedSender<Outgoing>,
    pending: Mutex<PendingMap>,
    next_id: AtomicU64,
    greeted: AtomicBool,
    closing: AtomicBool,
    alive: AtomicBool,
    request_timeout: Duration,
    connected_at: DateTime<Utc>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Link {
    /// Start the reader and writer tasks for `stream`.
    pub(crate) fn spawn(
        stream: TcpStream,
        origin: LinkOrigin,
        remote: Option<String>,
        request_timeout: Duration,
        handler: Weak<dyn LinkHandler>,
    ) -> Arc<Link> {
        let (reader, writer) = stream.into_split();
        let (outbox, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Link {
            origin,
            remote: Mutex::new(remote),
            outbox,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            greeted: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            request_timeout,
            connected_at: Utc::now(),
            tasks: Mutex::new(Vec::new()),
        });

        let writer_task = tokio::spawn(write_loop(writer, rx));
        let reader_link = Arc::clone(&link);
        let reader_task = tokio::spawn(async move {
            let result = read_loop(reader, &reader_link, &handler).await;
            if let Err(e) = result {
                debug!(url = ?reader_link.remote(), "Link reader ended: {e}");
            }
            reader_link.alive.store(false, Ordering::SeqCst);
            reader_link.fail_pending();
            if let Some(handler) = handler.upgrade() {
                handler.on_closed(&reader_link);
            }
        });

        let mut tasks = link.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(writer_task.abort_handle());
        tasks.push(reader_task.abort_handle());
        drop(tasks);
        link
    }

    /// URL of the remote host, once known.
    pub fn remote(&self) -> Option<String> {
        self.remote.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn set_remote(&self, url: &str) {
        *self.remote.lock().unwrap_or_else(|e| e.into_inner()) = Some(url.to_string());
    }

    /// Which side opened the link.
    pub fn origin(&self) -> LinkOrigin {
        self.origin
    }

    /// Whether the greeting exchange has completed.
    pub fn is_greeted(&self) -> bool {
        self.greeted.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_greeted(&self) {
        self.greeted.store(true, Ordering::SeqCst);
    }

    /// Whether the link is being closed on purpose. A closing link is never
    /// reconnected.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Whether the reader is still running.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// Introspection snapshot. `None` until the remote URL is known.
    pub fn info(&self) -> Option<LinkInfo> {
        self.remote().map(|url| LinkInfo {
            url,
            origin: self.origin,
            connected_at: self.connected_at,
        })
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, request: LinkRequest) -> Result<Value, LinkFailure> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        let method = request.method();
        let frame = LinkMessage {
            id,
            kind: LinkMessageKind::Request(request),
        };
        if !self.is_alive() || self.outbox.send(Outgoing::Frame(frame)).is_err() {
            self.forget(id);
            return Err(LinkFailure::Closed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => Err(LinkFailure::Remote(err)),
            Ok(Err(_)) => Err(LinkFailure::Closed),
            Err(_) => {
                self.forget(id);
                debug!(url = ?self.remote(), method, "Link request timed out");
                Err(LinkFailure::Timeout(self.request_timeout))
            }
        }
    }

    /// Queue a one-way notification. Returns false when the link is gone.
    pub fn notify(&self, notification: LinkNotification) -> bool {
        let frame = LinkMessage {
            id: 0,
            kind: LinkMessageKind::Notification(notification),
        };
        self.outbox.send(Outgoing::Frame(frame)).is_ok()
    }

    fn respond(&self, id: u64, response: LinkResponse) {
        let frame = LinkMessage {
            id,
            kind: LinkMessageKind::Response(response),
        };
        let _ = self.outbox.send(Outgoing::Frame(frame));
    }

    fn complete(&self, id: u64, response: LinkResponse) {
        let tx = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        match tx {
            Some(tx) => {
                let outcome = match response {
                    LinkResponse::Success { result } => Ok(result),
                    LinkResponse::Error(err) => Err(err),
                };
                let _ = tx.send(outcome);
            }
            None => debug!(url = ?self.remote(), id, "Dropping response with no pending request"),
        }
    }

    fn forget(&self, id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    fn fail_pending(&self) {
        // Dropping the senders wakes every waiter with `Closed`.
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Close after flushing queued frames. The reader is stopped at once.
    pub(crate) fn shutdown(&self) {
        self.mark_closing();
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.outbox.send(Outgoing::Shutdown);
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        // The reader is the second task; the writer drains and exits itself.
        if let Some(reader) = tasks.get(1) {
            reader.abort();
        }
        drop(tasks);
        self.fail_pending();
    }

    /// Drop the socket immediately without flushing anything.
    pub(crate) fn kill(&self) {
        self.mark_closing();
        self.alive.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            task.abort();
        }
        self.fail_pending();
    }
}

/// Why a link request failed.
#[derive(Debug)]
pub enum LinkFailure {
    /// The remote answered with an error.
    Remote(LinkError),
    /// No answer within the request timeout.
    Timeout(Duration),
    /// The link closed before an answer arrived.
    Closed,
}

impl From<LinkFailure> for CourierError {
    fn from(failure: LinkFailure) -> Self {
        match failure {
            LinkFailure::Remote(err) => {
                CourierError::Link(format!("Remote error {}: {}", err.code, err.message))
            }
            LinkFailure::Timeout(after) => CourierError::Timeout(after),
            LinkFailure::Closed => CourierError::ConnectionClosed,
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(out) = rx.recv().await {
        match out {
            Outgoing::Frame(msg) => {
                if let Err(e) = write_message(&mut writer, &msg).await {
                    debug!("Link writer stopped: {e}");
                    return;
                }
            }
            Outgoing::Shutdown => {
                let _ = writer.shutdown().await;
                return;
            }
        }
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    link: &Arc<Link>,
    handler: &Weak<dyn LinkHandler>,
) -> Result<(), WireError> {
    loop {
        let msg = match read_message(&mut reader).await {
            Ok(m) => m,
            Err(WireError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e),
        };
        let Some(handler) = handler.upgrade() else {
            return Ok(());
        };

        match msg.kind {
            LinkMessageKind::Response(response) => link.complete(msg.id, response),
            LinkMessageKind::Request(request) => {
                let response = handler.on_request(link, request);
                link.respond(msg.id, response);
            }
            LinkMessageKind::Notification(notification) => {
                if link.origin() == LinkOrigin::Outbound || link.is_greeted() {
                    handler.on_notification(link, notification);
                } else {
                    warn!("Ignoring notification on a link that has not greeted");
                }
            }
        }

        if link.is_closing() {
            let _ = link.outbox.send(Outgoing::Shutdown);
            return Ok(());
        }
    }
}
