//! Configuration types: transports, hosts and whole nodes.
//!
//! Transport and host entries use the camelCase keys of the declarative
//! configuration surface (`networkId`, `reconnectDelay`, ...); snake_case
//! aliases are accepted so the same structs read naturally from TOML.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Serde helper for `Duration` as milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (dur.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Declarative transport entry: `{ type, id?, default?, networkId?, ... }`.
///
/// Fields the core does not know about are kept in `extra` for the
/// transport's own constructor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Type name looked up in the transport registry.
    #[serde(rename = "type")]
    pub transport_type: String,
    /// Optional id used for `id@transportId` routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Whether connections on this transport become the agent's default.
    #[serde(default)]
    pub default: bool,
    /// Locality hint matched against `scheme://networkId/id` addresses.
    #[serde(
        default,
        rename = "networkId",
        alias = "network_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub network_id: Option<String>,
    /// Type-specific fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TransportConfig {
    /// A minimal entry of the given type.
    pub fn new(transport_type: impl Into<String>) -> Self {
        Self {
            transport_type: transport_type.into(),
            id: None,
            default: false,
            network_id: None,
            extra: Map::new(),
        }
    }

    /// Set the transport id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Flag the transport as default.
    pub fn as_default(mut self) -> Self {
        self.default = true;
        self
    }

    /// Set the network id.
    pub fn with_network_id(mut self, network_id: impl Into<String>) -> Self {
        self.network_id = Some(network_id.into());
        self
    }

    /// Read a type-specific string field.
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

/// Peer network host settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HostConfig {
    /// Network this host belongs to. Adopted from the first peer host when
    /// unset; immutable once known.
    #[serde(alias = "network_id", skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    /// Give up reconnecting after this long since the link dropped.
    #[serde(alias = "reconnect_timeout", with = "duration_ms")]
    pub reconnect_timeout: Duration,
    /// Delay before the first reconnect attempt.
    #[serde(alias = "reconnect_delay", with = "duration_ms")]
    pub reconnect_delay: Duration,
    /// Factor applied to the delay after each failed attempt.
    #[serde(alias = "reconnect_decay")]
    pub reconnect_decay: f64,
    /// Host-to-host request timeout.
    #[serde(alias = "request_timeout", with = "duration_ms")]
    pub request_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            network_id: None,
            reconnect_timeout: Duration::from_secs(5 * 60),
            reconnect_delay: Duration::from_secs(1),
            reconnect_decay: 2.0,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration of a whole node, as read from `config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Socket address the host listens on, e.g. `127.0.0.1:3000`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    /// Host URLs to join on startup.
    pub join: Vec<String>,
    /// Host settings.
    pub host: HostConfig,
    /// Transports to load into the registry.
    pub transports: Vec<TransportConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            listen: None,
            join: Vec::new(),
            host: HostConfig::default(),
            transports: Vec::new(),
        }
    }
}
