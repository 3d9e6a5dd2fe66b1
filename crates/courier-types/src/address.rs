//! Address syntax accepted by `Agent::send`.
//!
//! Three forms are recognised, tried in this order:
//!
//! - `scheme://network-or-domain/id`
//! - `id@transportId`
//! - bare `id`

/// URL schemes whose addresses are routed by transport type rather than by
/// network id. `https` and `wss` are folded into `http` and `ws`.
pub const TRANSPORT_SCHEMES: &[&str] = &["http", "ws"];

/// A parsed destination address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// `scheme://domain/path` where the scheme names a transport type.
    Protocol {
        /// Normalised scheme (`https` → `http`, `wss` → `ws`).
        scheme: String,
        /// The full original address, passed through to the transport.
        url: String,
    },
    /// `scheme://networkId/id` where the scheme is not a transport scheme.
    Network {
        /// The domain component, matched against transport network ids.
        network_id: String,
        /// The destination id on that network.
        id: String,
    },
    /// `id@transportId`.
    Transport {
        /// Destination id.
        id: String,
        /// Id of the transport to route through.
        transport_id: String,
    },
    /// A bare id, routed via the default connection.
    Local(String),
}

impl Address {
    /// Parse a destination string.
    pub fn parse(to: &str) -> Self {
        if let Some((scheme, rest)) = to.split_once("://") {
            let scheme = normalize_scheme(scheme);
            let (domain, path) = rest.split_once('/').unwrap_or((rest, ""));
            if TRANSPORT_SCHEMES.contains(&scheme.as_str()) {
                return Address::Protocol {
                    scheme,
                    url: to.to_string(),
                };
            }
            return Address::Network {
                network_id: domain.to_string(),
                id: path.to_string(),
            };
        }

        if let Some((id, transport_id)) = to.rsplit_once('@') {
            return Address::Transport {
                id: id.to_string(),
                transport_id: transport_id.to_string(),
            };
        }

        Address::Local(to.to_string())
    }
}

fn normalize_scheme(scheme: &str) -> String {
    match scheme.to_ascii_lowercase().as_str() {
        "https" => "http".to_string(),
        "wss" => "ws".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_id() {
        assert_eq!(Address::parse("agent1"), Address::Local("agent1".into()));
    }

    #[test]
    fn test_transport_id() {
        assert_eq!(
            Address::parse("agent1@local-a"),
            Address::Transport {
                id: "agent1".into(),
                transport_id: "local-a".into(),
            }
        );
    }

    #[test]
    fn test_https_folds_into_http() {
        assert_eq!(
            Address::parse("https://example.com/agents/a1"),
            Address::Protocol {
                scheme: "http".into(),
                url: "https://example.com/agents/a1".into(),
            }
        );
    }

    #[test]
    fn test_unknown_scheme_routes_by_network() {
        assert_eq!(
            Address::parse("mesh://net-7/a2"),
            Address::Network {
                network_id: "net-7".into(),
                id: "a2".into(),
            }
        );
    }

    #[test]
    fn test_url_takes_precedence_over_at() {
        // An '@' inside a URL is not a transport selector.
        match Address::parse("ws://user@host/a1") {
            Address::Protocol { scheme, .. } => assert_eq!(scheme, "ws"),
            other => panic!("expected protocol address, got {other:?}"),
        }
    }
}
