//! Courier peer network: host-to-host messaging.
//!
//! Hosts form a self-organizing mesh over TCP links using a JSON framed
//! request/response protocol, so that a message reaches a peer regardless
//! of which process it lives in.
//!
//! ## Architecture
//!
//! - **Host**: peer registry, gossip join, `find`/`send`, publish/subscribe
//!   and reconnect with backoff
//! - **Peer**: a local mailbox with a single message listener
//! - **Link**: one framed TCP connection to another host
//! - **MeshTransport**: the `mesh` transport binding agents to host peers

pub mod events;
pub mod host;
pub mod link;
pub mod message;
pub mod peer;
pub mod reconnect;
pub mod transport;

pub use events::HostEvent;
pub use host::{normalize_url, ChannelListener, Host, PeerLocation, SubscriptionId};
pub use link::{LinkInfo, LinkOrigin, WireError};
pub use message::{LinkMessage, LinkNotification, LinkRequest, LinkResponse};
pub use peer::{Peer, PeerListener};
pub use reconnect::ReconnectPolicy;
pub use transport::{MeshConnection, MeshTransport, MESH_TRANSPORT};
