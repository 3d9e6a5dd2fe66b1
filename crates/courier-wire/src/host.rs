//! Host: peer registry, gossip discovery and reconnecting links.
//!
//! A [`Host`] keeps local [`Peer`]s and TCP links to other hosts. Joining a
//! host exchanges a `greeting`, after which both sides tell their other
//! links about the newcomer so the mesh fills in on its own. Messages to
//! remote peers are routed by asking every linked host who owns the peer
//! (`find`) and caching the answer until a delivery fails or the owner says
//! goodbye. Links that drop without a goodbye are redialed with geometric
//! backoff until the reconnect budget runs out.

use crate::events::{EventBus, HostEvent};
use crate::link::{Link, LinkFailure, LinkHandler, LinkInfo, LinkOrigin};
use crate::message::*;
use crate::peer::Peer;
use crate::reconnect::ReconnectPolicy;

use courier_types::{CourierError, CourierResult, HostConfig};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::select_ok;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

/// Handle identifying one channel subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Callback receiving messages published on a channel.
pub type ChannelListener = Arc<dyn Fn(Value) + Send + Sync>;

/// Where a peer lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerLocation {
    /// On this host.
    Local,
    /// On the host listening at this URL.
    Remote(String),
}

struct Subscriber {
    id: SubscriptionId,
    listener: ChannelListener,
}

struct ReconnectTimer {
    generation: u64,
    handle: AbortHandle,
}

#[derive(Debug, Deserialize)]
struct GreetingReply {
    url: String,
    #[serde(rename = "networkId", default)]
    network_id: Option<String>,
}

/// Canonicalize a host URL to `tcp://host:port`. A bare `host:port` is
/// accepted.
pub fn normalize_url(raw: &str) -> CourierResult<String> {
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("tcp://{raw}")
    };
    let invalid = |why: &str| CourierError::Config(format!("Invalid host URL \"{raw}\": {why}"));
    let parsed = Url::parse(&with_scheme).map_err(|e| invalid(&e.to_string()))?;
    if parsed.scheme() != "tcp" {
        return Err(invalid("scheme must be tcp"));
    }
    let host = parsed.host_str().ok_or_else(|| invalid("missing host"))?;
    let port = parsed.port().ok_or_else(|| invalid("missing port"))?;
    Ok(format!("tcp://{host}:{port}"))
}

fn dial_addr(url: &str) -> &str {
    url.strip_prefix("tcp://").unwrap_or(url)
}

/// A peer network node.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

pub(crate) struct HostInner {
    this: Weak<HostInner>,
    config: HostConfig,
    url: OnceLock<String>,
    network_id: OnceLock<String>,
    peers: DashMap<String, Arc<Peer>>,
    /// Remote peer id -> owning host URL. A cache; may be stale.
    addresses: DashMap<String, String>,
    channels: DashMap<String, Vec<Subscriber>>,
    connections: DashMap<String, Arc<Link>>,
    timers: DashMap<String, ReconnectTimer>,
    joining: DashMap<String, ()>,
    listener: Mutex<Option<AbortHandle>>,
    closed: AtomicBool,
    events: EventBus,
    next_subscription: AtomicU64,
    next_timer: AtomicU64,
}

impl Default for Host {
    fn default() -> Self {
        Self::new(HostConfig::default())
    }
}

impl Host {
    /// Create a host. It serves local peers right away; call
    /// [`listen`](Self::listen) before joining other hosts.
    pub fn new(config: HostConfig) -> Self {
        let network_id = OnceLock::new();
        if let Some(id) = &config.network_id {
            let _ = network_id.set(id.clone());
        }
        let inner = Arc::new_cyclic(|this| HostInner {
            this: this.clone(),
            config,
            url: OnceLock::new(),
            network_id,
            peers: DashMap::new(),
            addresses: DashMap::new(),
            channels: DashMap::new(),
            connections: DashMap::new(),
            timers: DashMap::new(),
            joining: DashMap::new(),
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
            events: EventBus::new(),
            next_subscription: AtomicU64::new(1),
            next_timer: AtomicU64::new(1),
        });
        Self { inner }
    }

    /// Bind a TCP listener on `addr` (e.g. `127.0.0.1:0`) and start
    /// accepting links. Returns the host URL.
    pub async fn listen(&self, addr: &str) -> CourierResult<String> {
        if self.inner.is_closed() {
            return Err(CourierError::ConnectionClosed);
        }
        if let Some(url) = self.inner.url.get() {
            return Err(CourierError::Config(format!(
                "Host is already listening on {url}"
            )));
        }

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let url = format!("tcp://{local_addr}");
        if self.inner.url.set(url.clone()).is_err() {
            return Err(CourierError::Config("Host is already listening".to_string()));
        }

        info!(url = %url, "Host listening");
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(accept_loop(listener, weak));
        *self.inner.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(task.abort_handle());
        self.inner
            .events
            .publish(HostEvent::Listening { url: url.clone() });
        Ok(url)
    }

    /// URL this host listens on, once listening.
    pub fn url(&self) -> Option<String> {
        self.inner.url.get().cloned()
    }

    /// Network id, once configured or adopted.
    pub fn network_id(&self) -> Option<String> {
        self.inner.network_id.get().cloned()
    }

    /// Whether [`close`](Self::close) or [`abort`](Self::abort) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<HostEvent> {
        self.inner.events.subscribe()
    }

    /// Register a local peer. Fails if the id is taken.
    pub fn create(&self, id: &str) -> CourierResult<Arc<Peer>> {
        match self.inner.peers.entry(id.to_string()) {
            Entry::Occupied(_) => Err(CourierError::PeerExists(id.to_string())),
            Entry::Vacant(v) => {
                let peer = Arc::new(Peer::new(id, Arc::downgrade(&self.inner)));
                v.insert(Arc::clone(&peer));
                debug!(peer = %id, "Peer created");
                Ok(peer)
            }
        }
    }

    /// Unregister a local peer.
    pub fn remove(&self, id: &str) -> Option<Arc<Peer>> {
        let removed = self.inner.peers.remove(id).map(|(_, peer)| peer);
        if removed.is_some() {
            debug!(peer = %id, "Peer removed");
        }
        removed
    }

    /// Look up a local peer.
    pub fn get(&self, id: &str) -> Option<Arc<Peer>> {
        self.inner.local_peer(id)
    }

    /// Ids of all local peers, sorted.
    pub fn peers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.peers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// URLs of all linked hosts, sorted.
    pub fn hosts(&self) -> Vec<String> {
        self.inner.hosts()
    }

    /// Snapshot of every live link.
    pub fn links(&self) -> Vec<LinkInfo> {
        let mut links: Vec<LinkInfo> = self
            .inner
            .connections
            .iter()
            .filter_map(|e| e.value().info())
            .collect();
        links.sort_by(|a, b| a.url.cmp(&b.url));
        links
    }

    /// Link to the host at `url` and, through gossip, to every host it
    /// knows. The local host must be listening.
    pub async fn join(&self, url: &str) -> CourierResult<()> {
        let url = normalize_url(url)?;
        if self.inner.url.get() == Some(&url) {
            return Ok(());
        }
        self.inner.connect(&url).await?;
        self.inner.cancel_timer(&url);
        Ok(())
    }

    /// Resolve which host owns `id`.
    pub async fn find(&self, id: &str) -> CourierResult<PeerLocation> {
        self.inner.find(id).await
    }

    /// Deliver `message` from `from` to the peer `to`, wherever it lives.
    pub async fn send(&self, from: &str, to: &str, message: Value) -> CourierResult<()> {
        self.inner.send(from, to, message).await
    }

    /// Publish on `channel`: local subscribers run synchronously, linked
    /// hosts are notified without acknowledgement.
    pub fn publish(&self, channel: &str, message: Value) {
        self.inner.deliver_local(channel, &message);
        for link in self.inner.live_links() {
            link.notify(LinkNotification::Publish {
                channel: channel.to_string(),
                message: message.clone(),
            });
        }
    }

    /// Subscribe to messages published on `channel`, here or on any linked
    /// host.
    pub fn subscribe<F>(&self, channel: &str, listener: F) -> SubscriptionId
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::SeqCst));
        self.inner
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber {
                id,
                listener: Arc::new(listener),
            });
        id
    }

    /// Remove a subscription. Returns false if it was not found.
    pub fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> bool {
        let mut removed = false;
        if let Some(mut subs) = self.inner.channels.get_mut(channel) {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            removed = subs.len() != before;
        }
        self.inner.channels.remove_if(channel, |_, subs| subs.is_empty());
        removed
    }

    /// Round-trip `data` through the linked host at `url`.
    pub async fn ping(&self, url: &str, data: Value) -> CourierResult<Value> {
        let url = normalize_url(url)?;
        let link = self
            .inner
            .link(&url)
            .ok_or_else(|| CourierError::Link(format!("Host {url} is not connected")))?;
        link.request(LinkRequest::Ping { data })
            .await
            .map_err(CourierError::from)
    }

    /// Say goodbye to every linked host, then tear everything down.
    pub async fn close(&self) -> CourierResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.stop_listener_and_timers();
        for link in self.inner.drain_links() {
            link.notify(LinkNotification::Goodbye);
            link.shutdown();
        }
        info!(url = ?self.inner.url.get(), "Host closed");
        Ok(())
    }

    /// Tear everything down without saying goodbye. Linked hosts see the
    /// links drop and start reconnecting.
    pub fn abort(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.stop_listener_and_timers();
        for link in self.inner.drain_links() {
            link.kill();
        }
        info!(url = ?self.inner.url.get(), "Host aborted");
    }
}

impl HostInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn local_peer(&self, id: &str) -> Option<Arc<Peer>> {
        self.peers.get(id).map(|p| Arc::clone(p.value()))
    }

    fn link(&self, url: &str) -> Option<Arc<Link>> {
        self.connections.get(url).map(|l| Arc::clone(l.value()))
    }

    fn hosts(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        urls.sort();
        urls
    }

    fn live_links(&self) -> Vec<Arc<Link>> {
        self.connections
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    fn other_links(&self, url: &str) -> Vec<Arc<Link>> {
        self.connections
            .iter()
            .filter(|e| e.key() != url)
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    fn drain_links(&self) -> Vec<Arc<Link>> {
        let links = self.live_links();
        self.connections.clear();
        links
    }

    fn stop_listener_and_timers(&self) {
        if let Some(handle) = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        let urls: Vec<String> = self.timers.iter().map(|e| e.key().clone()).collect();
        for url in urls {
            self.cancel_timer(&url);
        }
    }

    fn evict_addresses(&self, url: &str) {
        self.addresses.retain(|_, owner| owner.as_str() != url);
    }

    fn deliver_local(&self, channel: &str, message: &Value) {
        let listeners: Vec<ChannelListener> = match self.channels.get(channel) {
            Some(subs) => subs.iter().map(|s| Arc::clone(&s.listener)).collect(),
            None => return,
        };
        for listener in listeners {
            listener(message.clone());
        }
    }

    /// Set the network id if unknown. Returns the local id on mismatch.
    fn adopt_network_id(&self, remote: Option<&str>) -> Result<(), String> {
        match remote {
            Some(remote) => {
                let local = self.network_id.get_or_init(|| remote.to_string());
                if local == remote {
                    Ok(())
                } else {
                    Err(local.clone())
                }
            }
            None => {
                self.network_id
                    .get_or_init(|| uuid::Uuid::new_v4().to_string());
                Ok(())
            }
        }
    }

    /// Whether `existing` should stay registered over `candidate` for the
    /// same remote. Between links opened by opposite sides, the one opened
    /// by the host with the smaller URL wins; otherwise the newer one wins.
    fn keep_existing(&self, existing: &Link, candidate: &Link, remote_url: &str) -> bool {
        if existing.origin() == candidate.origin() {
            return false;
        }
        let own_url = self.url.get().map(String::as_str).unwrap_or_default();
        let opener = |link: &Link| match link.origin() {
            LinkOrigin::Outbound => own_url,
            LinkOrigin::Inbound => remote_url,
        };
        opener(existing) < opener(candidate)
    }

    /// Register `link` as the link to `url`, resolving duplicates. Returns
    /// whether `link` was kept.
    fn register_link(&self, url: &str, link: &Arc<Link>, in_reader: bool) -> bool {
        let (kept, loser) = match self.connections.entry(url.to_string()) {
            Entry::Vacant(v) => {
                v.insert(Arc::clone(link));
                (true, None)
            }
            Entry::Occupied(mut o) => {
                let existing = Arc::clone(o.get());
                if Arc::ptr_eq(&existing, link) {
                    (true, None)
                } else if self.keep_existing(&existing, link, url) {
                    (false, Some(Arc::clone(link)))
                } else {
                    o.insert(Arc::clone(link));
                    (true, Some(existing))
                }
            }
        };

        if let Some(loser) = loser {
            debug!(url = %url, origin = ?loser.origin(), "Dropping duplicate link");
            if in_reader && Arc::ptr_eq(&loser, link) {
                // Let the reader flush the reply before closing.
                loser.mark_closing();
            } else {
                loser.shutdown();
            }
        }
        kept
    }

    fn cancel_timer(&self, url: &str) {
        if let Some((_, timer)) = self.timers.remove(url) {
            timer.handle.abort();
        }
    }

    fn finish_timer(&self, url: &str, generation: u64) {
        self.timers.remove_if(url, |_, t| t.generation == generation);
    }

    /// Dial `url`, greet it, register the link and exchange host lists.
    async fn connect(&self, url: &str) -> CourierResult<Arc<Link>> {
        let own_url = self
            .url
            .get()
            .cloned()
            .ok_or_else(|| CourierError::Link("Host must listen before joining".to_string()))?;
        if self.is_closed() {
            return Err(CourierError::ConnectionClosed);
        }
        if let Some(link) = self.link(url) {
            return Ok(link);
        }

        debug!(url = %url, "Dialing host");
        let stream = TcpStream::connect(dial_addr(url)).await?;
        let handler: Weak<dyn LinkHandler> = self.this.clone();
        let link = Link::spawn(
            stream,
            LinkOrigin::Outbound,
            Some(url.to_string()),
            self.config.request_timeout,
            handler,
        );

        let greeting = LinkRequest::Greeting {
            url: own_url,
            network_id: self.network_id.get().cloned(),
        };
        let reply = match link.request(greeting).await {
            Ok(reply) => reply,
            Err(LinkFailure::Remote(err)) if err.code == 403 => {
                link.shutdown();
                let remote = err
                    .data
                    .as_ref()
                    .and_then(|d| d.get("networkId"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                warn!(url = %url, remote_network = %remote, "Greeting rejected");
                return Err(CourierError::NetworkMismatch {
                    local: self.network_id.get().cloned().unwrap_or_default(),
                    remote,
                });
            }
            Err(failure) => {
                link.shutdown();
                // A simultaneous link from the other side may have won.
                if let Some(existing) = self.link(url) {
                    return Ok(existing);
                }
                return Err(failure.into());
            }
        };

        let reply: GreetingReply = match serde_json::from_value(reply) {
            Ok(reply) => reply,
            Err(e) => {
                link.shutdown();
                return Err(e.into());
            }
        };
        if let Err(local) = self.adopt_network_id(reply.network_id.as_deref()) {
            link.shutdown();
            return Err(CourierError::NetworkMismatch {
                local,
                remote: reply.network_id.unwrap_or_default(),
            });
        }
        link.mark_greeted();
        if self.is_closed() {
            link.shutdown();
            return Err(CourierError::ConnectionClosed);
        }

        let others = self.other_links(url);
        let kept = self.register_link(url, &link, false);
        info!(url = %url, advertised = %reply.url, "Linked to host");
        self.events.publish(HostEvent::Connected {
            url: url.to_string(),
        });
        for other in others {
            other.notify(LinkNotification::Join {
                url: url.to_string(),
            });
        }

        match link.request(LinkRequest::Hosts).await {
            Ok(hosts) => {
                let hosts: Vec<String> = serde_json::from_value(hosts).unwrap_or_default();
                for host in hosts {
                    self.join_in_background(&host);
                }
            }
            Err(e) => debug!(url = %url, "Host list exchange failed: {e:?}"),
        }

        self.events.publish(HostEvent::Joined {
            url: url.to_string(),
        });
        if kept {
            Ok(link)
        } else {
            Ok(self.link(url).unwrap_or(link))
        }
    }

    /// Join a gossiped host unless it is this host, already linked, or
    /// already being joined.
    fn join_in_background(&self, raw: &str) {
        let url = match normalize_url(raw) {
            Ok(url) => url,
            Err(e) => {
                warn!("Ignoring gossiped host: {e}");
                return;
            }
        };
        if self.url.get() == Some(&url) || self.connections.contains_key(&url) {
            return;
        }
        if self.joining.insert(url.clone(), ()).is_some() {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let result = this.connect(&url).await;
            this.joining.remove(&url);
            match result {
                Ok(_) => this.cancel_timer(&url),
                Err(e) => warn!(url = %url, "Gossiped join failed: {e}"),
            }
        });
    }

    async fn find(&self, id: &str) -> CourierResult<PeerLocation> {
        if self.peers.contains_key(id) {
            return Ok(PeerLocation::Local);
        }
        if let Some(url) = self.addresses.get(id).map(|u| u.value().clone()) {
            return Ok(PeerLocation::Remote(url));
        }

        let links: Vec<(String, Arc<Link>)> = self
            .connections
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        if links.is_empty() {
            return Err(CourierError::PeerNotFound(id.to_string()));
        }

        debug!(peer = %id, hosts = links.len(), "Searching linked hosts");
        let queries = links.into_iter().map(|(url, link)| {
            let id = id.to_string();
            Box::pin(async move {
                match link.request(LinkRequest::Find { id }).await {
                    Ok(Value::String(_)) => Ok(url),
                    _ => Err(()),
                }
            })
        });
        match select_ok(queries).await {
            Ok((url, _)) => {
                self.addresses.insert(id.to_string(), url.clone());
                Ok(PeerLocation::Remote(url))
            }
            Err(()) => Err(CourierError::PeerNotFound(id.to_string())),
        }
    }

    pub(crate) async fn send(&self, from: &str, to: &str, message: Value) -> CourierResult<()> {
        if let Some(peer) = self.local_peer(to) {
            peer.deliver(from.to_string(), message);
            return Ok(());
        }

        // A cached owner without a live link is forgotten and searched for
        // once more among the hosts that are linked.
        let mut searched_again = false;
        let (url, link) = loop {
            let url = match self.find(to).await? {
                PeerLocation::Local => {
                    return match self.local_peer(to) {
                        Some(peer) => {
                            peer.deliver(from.to_string(), message);
                            Ok(())
                        }
                        None => Err(CourierError::PeerNotFound(to.to_string())),
                    };
                }
                PeerLocation::Remote(url) => url,
            };
            if let Some(link) = self.link(&url) {
                break (url, link);
            }
            self.addresses.remove_if(to, |_, owner| *owner == url);
            if searched_again {
                return Err(CourierError::Link(format!("Host {url} is not connected")));
            }
            debug!(peer = %to, url = %url, "Cached owner is not linked, searching again");
            searched_again = true;
        };

        let request = LinkRequest::Send {
            from: from.to_string(),
            to: to.to_string(),
            message,
        };
        match link.request(request).await {
            Ok(_) => Ok(()),
            Err(LinkFailure::Remote(err)) if err.code == 404 => {
                self.addresses.remove_if(to, |_, owner| *owner == url);
                debug!(peer = %to, url = %url, "Evicted stale peer address");
                Err(CourierError::PeerNotFound(to.to_string()))
            }
            Err(failure) => Err(failure.into()),
        }
    }

    fn accept_greeting(
        &self,
        link: &Arc<Link>,
        url: String,
        network_id: Option<String>,
    ) -> LinkResponse {
        if link.is_greeted() {
            return LinkResponse::Error(LinkError::new(400, "Already greeted"));
        }
        let url = match normalize_url(&url) {
            Ok(url) => url,
            Err(e) => return LinkResponse::Error(LinkError::new(400, e.to_string())),
        };
        if let Err(local) = self.adopt_network_id(network_id.as_deref()) {
            warn!(url = %url, local = %local, remote = ?network_id, "Rejecting host from another network");
            return LinkResponse::Error(
                LinkError::new(403, "Network id mismatch").with_data(json!({ "networkId": local })),
            );
        }

        link.set_remote(&url);
        link.mark_greeted();
        let others = self.other_links(&url);
        self.register_link(&url, link, true);
        self.cancel_timer(&url);
        info!(url = %url, "Host joined");
        self.events.publish(HostEvent::Connected { url: url.clone() });
        for other in others {
            other.notify(LinkNotification::Join { url: url.clone() });
        }

        LinkResponse::Success {
            result: json!({
                "url": self.url.get(),
                "networkId": self.network_id.get(),
            }),
        }
    }

    fn schedule_reconnect(&self, url: String) {
        if self.is_closed() {
            return;
        }
        let generation = self.next_timer.fetch_add(1, Ordering::SeqCst);
        let entry = match self.timers.entry(url.clone()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(v) => v,
        };
        let policy = ReconnectPolicy::from(&self.config);
        let task = tokio::spawn(reconnect_loop(self.this.clone(), url, policy, generation));
        entry.insert(ReconnectTimer {
            generation,
            handle: task.abort_handle(),
        });
    }
}

impl LinkHandler for HostInner {
    fn on_request(&self, link: &Arc<Link>, request: LinkRequest) -> LinkResponse {
        if self.is_closed() {
            return LinkResponse::Error(LinkError::new(503, "Host is closing"));
        }
        let method = request.method();
        match request {
            LinkRequest::Greeting { url, network_id } => {
                self.accept_greeting(link, url, network_id)
            }
            _ if link.origin() == LinkOrigin::Inbound && !link.is_greeted() => {
                warn!(method, "Rejected request before greeting");
                LinkResponse::Error(LinkError::new(
                    401,
                    "Greeting required before any other request",
                ))
            }
            LinkRequest::Hosts => LinkResponse::Success {
                result: json!(self.hosts()),
            },
            LinkRequest::Find { id } => {
                let result = if self.peers.contains_key(&id) {
                    json!(self.url.get())
                } else {
                    Value::Null
                };
                LinkResponse::Success { result }
            }
            LinkRequest::Send { from, to, message } => match self.local_peer(&to) {
                Some(peer) => {
                    peer.deliver(from, message);
                    LinkResponse::Success {
                        result: Value::Null,
                    }
                }
                None => LinkResponse::Error(LinkError::new(
                    404,
                    CourierError::PeerNotFound(to).to_string(),
                )),
            },
            LinkRequest::Ping { data } => LinkResponse::Success { result: data },
        }
    }

    fn on_notification(&self, link: &Arc<Link>, notification: LinkNotification) {
        match notification {
            LinkNotification::Join { url } => self.join_in_background(&url),
            LinkNotification::Goodbye => {
                link.mark_closing();
                let Some(url) = link.remote() else {
                    return;
                };
                self.connections
                    .remove_if(&url, |_, registered| Arc::ptr_eq(registered, link));
                self.evict_addresses(&url);
                self.cancel_timer(&url);
                info!(url = %url, "Host said goodbye");
                self.events.publish(HostEvent::Goodbye { url });
            }
            LinkNotification::Publish { channel, message } => {
                self.deliver_local(&channel, &message);
            }
        }
    }

    fn on_closed(&self, link: &Arc<Link>) {
        let Some(url) = link.remote() else {
            return;
        };
        let removed = self
            .connections
            .remove_if(&url, |_, registered| Arc::ptr_eq(registered, link))
            .is_some();
        if !removed {
            return;
        }
        info!(url = %url, "Link closed");
        self.events.publish(HostEvent::Disconnected { url: url.clone() });
        if self.is_closed() || link.is_closing() {
            return;
        }
        self.schedule_reconnect(url);
    }
}

/// Internal accept loop: runs in a spawned task.
async fn accept_loop(listener: TcpListener, host: Weak<HostInner>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let Some(inner) = host.upgrade() else {
                    return;
                };
                if inner.is_closed() {
                    return;
                }
                debug!(%addr, "Accepted link");
                let handler: Weak<dyn LinkHandler> = host.clone();
                Link::spawn(
                    stream,
                    LinkOrigin::Inbound,
                    None,
                    inner.config.request_timeout,
                    handler,
                );
            }
            Err(e) => {
                error!("Accept error: {}", e);
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

/// Redial `url` with backoff until it answers or the budget runs out.
async fn reconnect_loop(
    host: Weak<HostInner>,
    url: String,
    policy: ReconnectPolicy,
    generation: u64,
) {
    let started = Instant::now();
    let mut attempt = 0u32;
    loop {
        let delay = policy.delay_for(attempt);
        if !policy.allows(started.elapsed(), delay) {
            break;
        }
        match host.upgrade() {
            Some(inner) => inner.events.publish(HostEvent::ReconnectScheduled {
                url: url.clone(),
                attempt,
                delay,
            }),
            None => return,
        }
        debug!(url = %url, attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        tokio::time::sleep(delay).await;

        let Some(inner) = host.upgrade() else {
            return;
        };
        if inner.is_closed() {
            return;
        }
        if inner.connections.contains_key(&url) {
            inner.finish_timer(&url, generation);
            return;
        }
        match inner.connect(&url).await {
            Ok(_) => {
                inner.finish_timer(&url, generation);
                info!(url = %url, attempt, "Reconnected");
                inner
                    .events
                    .publish(HostEvent::Reconnected { url: url.clone() });
                return;
            }
            Err(e) => debug!(url = %url, attempt, "Reconnect failed: {e}"),
        }
        attempt += 1;
    }

    let Some(inner) = host.upgrade() else {
        return;
    };
    inner.finish_timer(&url, generation);
    inner.evict_addresses(&url);
    warn!(url = %url, "Giving up reconnecting");
    inner.events.publish(HostEvent::GaveUp { url });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url() {
        assert_eq!(
            normalize_url("127.0.0.1:4000").unwrap(),
            "tcp://127.0.0.1:4000"
        );
        assert_eq!(
            normalize_url("tcp://localhost:9/ignored").unwrap(),
            "tcp://localhost:9"
        );
        assert!(normalize_url("http://127.0.0.1:4000").is_err());
        assert!(normalize_url("tcp://127.0.0.1").is_err());
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let host = Host::default();
        host.create("p1").unwrap();
        assert!(matches!(
            host.create("p1"),
            Err(CourierError::PeerExists(id)) if id == "p1"
        ));
        assert!(host.remove("p1").is_some());
        assert!(host.create("p1").is_ok());
    }

    #[tokio::test]
    async fn test_local_send_is_synchronous() {
        let host = Host::default();
        let a = host.create("a").unwrap();
        let b = host.create("b").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        b.on_message(move |from, msg| sink.lock().unwrap().push((from, msg)));

        a.send("b", json!("hi")).await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("a".to_string(), json!("hi"))]
        );
    }

    #[tokio::test]
    async fn test_find_with_no_hosts_fails() {
        let host = Host::default();
        assert!(matches!(
            host.find("ghost").await,
            Err(CourierError::PeerNotFound(_))
        ));
        host.create("here").unwrap();
        assert_eq!(host.find("here").await.unwrap(), PeerLocation::Local);
    }

    #[tokio::test]
    async fn test_join_requires_listening() {
        let host = Host::default();
        let err = host.join("tcp://127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, CourierError::Link(_)));
    }

    #[tokio::test]
    async fn test_local_publish_and_unsubscribe() {
        let host = Host::default();
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let sub = host.subscribe("news", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        host.publish("news", json!(1));
        assert!(host.unsubscribe("news", sub));
        assert!(!host.unsubscribe("news", sub));
        host.publish("news", json!(2));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_network_id_is_immutable_once_set() {
        let host = Host::new(HostConfig {
            network_id: Some("alpha".into()),
            ..HostConfig::default()
        });
        assert!(host.inner.adopt_network_id(Some("alpha")).is_ok());
        assert_eq!(
            host.inner.adopt_network_id(Some("beta")),
            Err("alpha".to_string())
        );
        assert!(host.inner.adopt_network_id(None).is_ok());
        assert_eq!(host.network_id().as_deref(), Some("alpha"));
    }
}
