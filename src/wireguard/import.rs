//! WireGuard peer config import
//!
//! Parses the INI-like text an operator pastes from a relay provider:
//!
//! ```text
//! [Interface]
//! PrivateKey = ...
//! Address = 10.64.0.2/32, fd00::2/128
//!
//! [Peer]
//! PublicKey = ...
//! Endpoint = relay.example.com:51820
//! AllowedIPs = 0.0.0.0/0, ::/0
//! ```
//!
//! Only the first `[Peer]` is used. Keys are matched ignoring case, spaces,
//! underscores and dashes, so `Allowed IPs` and `allowed_ips` both work.

use super::Endpoint;
use crate::model::{UpstreamConfig, UpstreamId, UpstreamServer};
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImportError {
    #[error("Missing [{0}] section")]
    MissingSection(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid {field}: {reason}")]
    InvalidFormat { field: String, reason: String },
}

/// Relay definition extracted from a peer config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedRelay {
    pub endpoint: Endpoint,
    pub public_key: String,
    pub preshared_key: Option<String>,
    pub client_private_key: String,
    pub allowed_ips: Vec<String>,
    pub tunnel_address: Option<String>,
    pub persistent_keepalive: Option<u16>,
}

impl ImportedRelay {
    /// Build a shared relay record around this definition
    pub fn into_upstream_server(
        self,
        id: UpstreamId,
        name: &str,
        interface_name: &str,
    ) -> UpstreamServer {
        UpstreamServer {
            id,
            name: name.to_string(),
            interface_name: interface_name.to_string(),
            endpoint: self.endpoint.to_string(),
            private_key: self.client_private_key,
            public_key: self.public_key,
            preshared_key: self.preshared_key,
            allowed_ips: self.allowed_ips,
            persistent_keepalive: self.persistent_keepalive.unwrap_or(25),
            mtu: 1360,
            enabled: true,
        }
    }
}

impl From<ImportedRelay> for UpstreamConfig {
    fn from(relay: ImportedRelay) -> Self {
        UpstreamConfig {
            enabled: true,
            endpoint_host: Some(relay.endpoint.host),
            endpoint_port: Some(relay.endpoint.port),
            public_key: Some(relay.public_key),
            pre_shared_key: relay.preshared_key,
            client_private_key: Some(relay.client_private_key),
            allowed_ips: relay.allowed_ips,
            tunnel_address: relay.tunnel_address,
            persistent_keepalive: relay.persistent_keepalive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Interface,
    Peer,
}

#[derive(Debug, Default)]
struct ParsedConfig {
    interface: HashMap<String, String>,
    peers: Vec<HashMap<String, String>>,
}

/// Parse a WireGuard config into the relay it describes
pub fn parse_relay_config(content: &str) -> Result<ImportedRelay, ImportError> {
    let parsed = tokenize(content);

    if parsed.interface.is_empty() {
        return Err(ImportError::MissingSection("Interface".into()));
    }
    let peer = parsed
        .peers
        .first()
        .ok_or_else(|| ImportError::MissingSection("Peer".into()))?;
    let iface = &parsed.interface;

    let client_private_key = required(iface, "privatekey", "PrivateKey")?;
    let public_key = required(peer, "publickey", "PublicKey")?;
    let endpoint: Endpoint = required(peer, "endpoint", "Endpoint")?.parse()?;

    let preshared_key = ["presharedkey", "psk", "sharedkey"]
        .iter()
        .find_map(|key| value(peer, key));

    Ok(ImportedRelay {
        endpoint,
        public_key,
        preshared_key,
        client_private_key,
        allowed_ips: split_list(peer.get("allowedips").map(String::as_str)),
        tunnel_address: split_list(iface.get("address").map(String::as_str))
            .into_iter()
            .next(),
        persistent_keepalive: value(peer, "persistentkeepalive").and_then(|v| v.parse().ok()),
    })
}

fn tokenize(content: &str) -> ParsedConfig {
    let mut result = ParsedConfig::default();
    let mut section: Option<Section> = None;

    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            let name = line[1..line.len() - 1].trim().to_ascii_lowercase();
            section = match name.as_str() {
                "interface" => Some(Section::Interface),
                "peer" => {
                    result.peers.push(HashMap::new());
                    Some(Section::Peer)
                }
                _ => None,
            };
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            continue;
        };
        let key = normalize_key(raw_key);
        if key.is_empty() {
            continue;
        }
        let value = strip_inline_comment(raw_value).to_string();

        match section {
            Some(Section::Interface) => {
                result.interface.insert(key, value);
            }
            Some(Section::Peer) => {
                if let Some(peer) = result.peers.last_mut() {
                    peer.insert(key, value);
                }
            }
            None => {}
        }
    }

    result
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn strip_inline_comment(value: &str) -> &str {
    match value.find(['#', ';']) {
        Some(idx) => value[..idx].trim(),
        None => value.trim(),
    }
}

fn value(map: &HashMap<String, String>, key: &str) -> Option<String> {
    map.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(
    map: &HashMap<String, String>,
    key: &str,
    field: &str,
) -> Result<String, ImportError> {
    value(map, key).ok_or_else(|| ImportError::MissingField(field.into()))
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(String::from)
        .collect()
}

fn invalid_endpoint(reason: impl Into<String>) -> ImportError {
    ImportError::InvalidFormat {
        field: "Endpoint".into(),
        reason: reason.into(),
    }
}

fn parse_port(value: &str) -> Result<u16, ImportError> {
    let value = value.trim();
    let port: u32 = value
        .parse()
        .map_err(|_| invalid_endpoint(format!("port '{value}' is not a number")))?;
    if !(1..=65535).contains(&port) {
        return Err(invalid_endpoint(format!("port {port} out of range")));
    }
    Ok(port as u16)
}

impl FromStr for Endpoint {
    type Err = ImportError;

    /// `host:port`, split on the last colon; IPv6 hosts must be bracketed
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        if value.is_empty() {
            return Err(ImportError::MissingField("Endpoint".into()));
        }

        let (host, port) = if let Some(rest) = value.strip_prefix('[') {
            let (host, remainder) = rest
                .split_once(']')
                .ok_or_else(|| invalid_endpoint("unterminated '['"))?;
            let port = remainder
                .trim()
                .strip_prefix(':')
                .ok_or_else(|| invalid_endpoint("missing port"))?;
            (host.trim(), port)
        } else {
            let (host, port) = value
                .rsplit_once(':')
                .ok_or_else(|| invalid_endpoint("missing port"))?;
            (host.trim(), port)
        };

        if host.is_empty() {
            return Err(invalid_endpoint("missing host"));
        }

        Ok(Endpoint {
            host: host.to_string(),
            port: parse_port(port)?,
        })
    }
}
