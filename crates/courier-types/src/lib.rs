//! Core types and traits for the Courier messaging runtime.
//!
//! This crate defines the data shared by the peer network and the agent
//! runtime: addresses, message envelopes, configuration, errors and the
//! transport contract. It contains no business logic.

pub mod address;
pub mod config;
pub mod envelope;
pub mod error;
pub mod transport;

pub use address::Address;
pub use config::{HostConfig, NodeConfig, TransportConfig};
pub use error::{CourierError, CourierResult};
pub use transport::{Connection, InboundHandler, Transport, TransportInfo};
