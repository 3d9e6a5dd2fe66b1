//! Shared error types for the Courier runtime.

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for the Courier runtime.
#[derive(Error, Debug)]
pub enum CourierError {
    /// A bare-id send was attempted with no default connection.
    #[error("No transport found")]
    NoTransport,

    /// No connection's transport carries the given network id.
    #[error("No transport found with networkId \"{0}\"")]
    NetworkNotFound(String),

    /// No connection's transport has the given protocol type.
    #[error("No transport found for protocol \"{0}\"")]
    ProtocolNotFound(String),

    /// No transport (or connection) has the given transport id.
    #[error("No transport found with id \"{0}\"")]
    TransportNotFound(String),

    /// More than one transport is registered under the same id.
    #[error("Multiple transports found with id \"{0}\"")]
    AmbiguousTransport(String),

    /// A transport of the same type and id is already registered.
    #[error("Transport already registered (type: {transport_type}, id: {id})")]
    DuplicateTransport {
        /// Transport type discriminator.
        transport_type: String,
        /// Transport id (empty when the transport has none).
        id: String,
    },

    /// A second connection flagged as default was requested.
    #[error("Cannot connect to a second default transport")]
    DuplicateDefault,

    /// A destination id is not bound on a transport.
    #[error("Agent with id {0} not found")]
    AgentNotFound(String),

    /// The transport type name is not in the registry's type table.
    #[error("Unknown type of transport \"{name}\". Choose from: {}", .known.join(","))]
    UnknownTransportType {
        /// The requested type.
        name: String,
        /// All registered type names.
        known: Vec<String>,
    },

    /// The module name is not in the module registry.
    #[error("Unknown module \"{name}\". Choose from: {}", .known.join(","))]
    UnknownModule {
        /// The requested module.
        name: String,
        /// All registered module names.
        known: Vec<String>,
    },

    /// A module capability with this name is already installed on the agent.
    #[error("Conflict: agent already has a property \"{0}\"")]
    NameCollision(String),

    /// The agent has no capability of the requested kind.
    #[error("Capability \"{0}\" is not loaded on this agent")]
    MissingCapability(&'static str),

    /// A correlated request or call received no reply in time.
    #[error("Timeout after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The remote side answered with an application error.
    #[error("{0}")]
    Remote(String),

    /// An RPC call was attempted without a method name.
    #[error("Property \"method\" expected")]
    MissingMethod,

    /// A message was shaped wrongly for the operation.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// No handler consumed an inbound message.
    #[error("Cannot receive message: no receive handler installed")]
    Unhandled,

    /// The peer id is not known on any reachable host.
    #[error("Peer not found (id: {0})")]
    PeerNotFound(String),

    /// A peer id is already registered on this host.
    #[error("Id already exists (id: {0})")]
    PeerExists(String),

    /// Two hosts disagree on the network they belong to.
    #[error("Network id mismatch (local: {local}, remote: {remote})")]
    NetworkMismatch {
        /// This host's network id.
        local: String,
        /// The other host's network id.
        remote: String,
    },

    /// The host or link was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A host-to-host link failed.
    #[error("Link error: {0}")]
    Link(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CourierError {
    /// Whether this error means the destination peer is unknown.
    pub fn is_peer_not_found(&self) -> bool {
        matches!(self, CourierError::PeerNotFound(_))
    }

    /// Whether this error is a correlation timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CourierError::Timeout(_))
    }
}

/// Alias for Result with CourierError.
pub type CourierResult<T> = Result<T, CourierError>;
