//! WireGuard relay definitions
//!
//! Relays reach the engine either as records or as a pasted peer config.
//! `import` turns the pasted text into a structured definition, `render`
//! writes the interface config that `wg-quick` brings up.

pub mod import;
pub mod render;

pub use import::{parse_relay_config, ImportError, ImportedRelay};
pub use render::render_interface_config;

use std::fmt;

/// Default allowed IPs when a relay does not restrict them
pub const DEFAULT_ALLOWED_IPS: [&str; 2] = ["0.0.0.0/0", "::/0"];

/// Remote relay address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Everything needed to bring one relay interface up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTunnel {
    pub private_key: String,
    pub address: Option<String>,
    pub mtu: Option<u16>,
    pub peer_public_key: String,
    pub preshared_key: Option<String>,
    pub allowed_ips: Vec<String>,
    pub endpoint: Endpoint,
    pub persistent_keepalive: Option<u16>,
}

impl RelayTunnel {
    /// Allowed IPs with the catch-all default applied
    pub fn effective_allowed_ips(&self) -> Vec<String> {
        if self.allowed_ips.is_empty() {
            DEFAULT_ALLOWED_IPS.iter().map(|s| s.to_string()).collect()
        } else {
            self.allowed_ips.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display_brackets_ipv6() {
        let v4 = Endpoint {
            host: "10.0.0.1".into(),
            port: 51820,
        };
        assert_eq!(v4.to_string(), "10.0.0.1:51820");

        let v6 = Endpoint {
            host: "2001:db8::1".into(),
            port: 51820,
        };
        assert_eq!(v6.to_string(), "[2001:db8::1]:51820");
    }

    #[test]
    fn test_effective_allowed_ips_default() {
        let relay = RelayTunnel {
            private_key: "k".into(),
            address: None,
            mtu: None,
            peer_public_key: "p".into(),
            preshared_key: None,
            allowed_ips: vec![],
            endpoint: Endpoint {
                host: "h".into(),
                port: 1,
            },
            persistent_keepalive: None,
        };
        assert_eq!(relay.effective_allowed_ips(), vec!["0.0.0.0/0", "::/0"]);
    }
}
