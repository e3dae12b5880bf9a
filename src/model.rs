//! Record types consumed by the routing engine
//!
//! These are plain data handed over by the record store. Nothing here talks
//! to the kernel; the engine only reads them. Every record is normalized
//! before use so that blank strings, padded values and unknown modes never
//! reach the command layer.

use crate::wireguard::{Endpoint, ImportError, RelayTunnel};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use thiserror::Error;

/// Numeric identity of a client record
pub type ClientId = u32;

/// Numeric identity of a shared upstream relay record
pub type UpstreamId = u32;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Failed to read records file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse records: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// Full record set handed to a reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordSet {
    pub clients: Vec<Client>,
    pub upstreams: Vec<UpstreamServer>,
    pub rules: Vec<SplitRule>,
}

impl RecordSet {
    pub fn load(path: &Path) -> Result<Self, RecordError> {
        let content = std::fs::read_to_string(path)?;
        let records: RecordSet = serde_json::from_str(&content)?;
        Ok(records.normalized())
    }

    pub fn normalized(self) -> Self {
        Self {
            clients: self.clients.into_iter().map(Client::normalized).collect(),
            upstreams: self
                .upstreams
                .into_iter()
                .map(UpstreamServer::normalized)
                .collect(),
            rules: self.rules.into_iter().map(SplitRule::normalized).collect(),
        }
    }

    pub fn upstream(&self, id: UpstreamId) -> Option<&UpstreamServer> {
        self.upstreams.iter().find(|u| u.id == id)
    }

    /// Enabled split rules belonging to one client, in record order
    pub fn rules_for(&self, client: ClientId) -> impl Iterator<Item = &SplitRule> {
        self.rules
            .iter()
            .filter(move |r| r.client_id == client && r.enabled)
    }
}

/// A remote-access VPN client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: ClientId,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub ipv4_address: String,
    #[serde(default)]
    pub ipv6_address: String,
    #[serde(default)]
    pub upstream: Option<UpstreamConfig>,
    #[serde(default)]
    pub split_tunnel: Option<SplitTunnelConfig>,
    /// Shared relay this client is routed through when it has no dedicated one
    #[serde(default)]
    pub shared_upstream_id: Option<UpstreamId>,
}

impl Client {
    pub fn new(id: ClientId, ipv4_address: &str, ipv6_address: &str) -> Self {
        Self {
            id,
            enabled: true,
            ipv4_address: ipv4_address.to_string(),
            ipv6_address: ipv6_address.to_string(),
            upstream: None,
            split_tunnel: None,
            shared_upstream_id: None,
        }
    }

    pub fn normalized(self) -> Self {
        Self {
            ipv4_address: self.ipv4_address.trim().to_string(),
            ipv6_address: self.ipv6_address.trim().to_string(),
            upstream: Some(self.upstream.unwrap_or_default().normalized()),
            split_tunnel: Some(self.split_tunnel.unwrap_or_default().normalized()),
            ..self
        }
    }

    pub fn upstream(&self) -> UpstreamConfig {
        self.upstream.clone().unwrap_or_default()
    }

    pub fn split_tunnel(&self) -> SplitTunnelConfig {
        self.split_tunnel.clone().unwrap_or_default()
    }
}

/// Dedicated point-to-point relay embedded in a client record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamConfig {
    pub enabled: bool,
    pub endpoint_host: Option<String>,
    pub endpoint_port: Option<u16>,
    pub public_key: Option<String>,
    pub pre_shared_key: Option<String>,
    pub client_private_key: Option<String>,
    pub allowed_ips: Vec<String>,
    pub tunnel_address: Option<String>,
    pub persistent_keepalive: Option<u16>,
}

impl UpstreamConfig {
    pub fn normalized(self) -> Self {
        Self {
            enabled: self.enabled,
            endpoint_host: normalize_optional(self.endpoint_host),
            endpoint_port: self.endpoint_port.filter(|p| *p != 0),
            public_key: normalize_optional(self.public_key),
            pre_shared_key: normalize_optional(self.pre_shared_key),
            client_private_key: normalize_optional(self.client_private_key),
            allowed_ips: normalize_list(self.allowed_ips),
            tunnel_address: normalize_optional(self.tunnel_address),
            persistent_keepalive: self.persistent_keepalive,
        }
    }

    /// Host, port, public key, client private key and tunnel address all set
    pub fn is_complete(&self) -> bool {
        self.endpoint_host.is_some()
            && self.endpoint_port.is_some()
            && self.public_key.is_some()
            && self.client_private_key.is_some()
            && self.tunnel_address.is_some()
    }

    /// The relay tunnel to provision, if this config is enabled and complete
    pub fn relay(&self) -> Option<RelayTunnel> {
        if !self.enabled {
            return None;
        }
        let config = self.clone().normalized();
        Some(RelayTunnel {
            private_key: config.client_private_key?,
            address: Some(config.tunnel_address?),
            mtu: None,
            peer_public_key: config.public_key?,
            preshared_key: config.pre_shared_key,
            allowed_ips: config.allowed_ips,
            endpoint: Endpoint {
                host: config.endpoint_host?,
                port: config.endpoint_port?,
            },
            persistent_keepalive: config.persistent_keepalive.filter(|k| *k > 0),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum SplitTunnelMode {
    /// No relay routing at all
    #[default]
    Direct,
    /// Everything from the client goes through the relay
    Upstream,
    /// Only destinations matched by proxy rules go through the relay
    Custom,
}

impl From<String> for SplitTunnelMode {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "upstream" => SplitTunnelMode::Upstream,
            "custom" => SplitTunnelMode::Custom,
            _ => SplitTunnelMode::Direct,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SplitTunnelConfig {
    pub mode: SplitTunnelMode,
    pub proxy_rules: Vec<String>,
    pub direct_rules: Vec<String>,
}

impl SplitTunnelConfig {
    pub fn normalized(self) -> Self {
        Self {
            mode: self.mode,
            proxy_rules: normalize_list(self.proxy_rules),
            direct_rules: normalize_list(self.direct_rules),
        }
    }
}

/// Relay shared by several clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamServer {
    pub id: UpstreamId,
    pub name: String,
    pub interface_name: String,
    /// `host:port`
    pub endpoint: String,
    pub private_key: String,
    pub public_key: String,
    #[serde(default)]
    pub preshared_key: Option<String>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default = "default_keepalive")]
    pub persistent_keepalive: u16,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl UpstreamServer {
    pub fn normalized(self) -> Self {
        Self {
            name: self.name.trim().to_string(),
            interface_name: self.interface_name.trim().to_string(),
            endpoint: self.endpoint.trim().to_string(),
            private_key: self.private_key.trim().to_string(),
            public_key: self.public_key.trim().to_string(),
            preshared_key: normalize_optional(self.preshared_key),
            allowed_ips: normalize_list(self.allowed_ips),
            ..self
        }
    }

    pub fn relay(&self) -> Result<RelayTunnel, ImportError> {
        let endpoint: Endpoint = self.endpoint.parse()?;
        Ok(RelayTunnel {
            private_key: self.private_key.clone(),
            address: None,
            mtu: Some(self.mtu),
            peer_public_key: self.public_key.clone(),
            preshared_key: self.preshared_key.clone(),
            allowed_ips: self.allowed_ips.clone(),
            endpoint,
            persistent_keepalive: Some(self.persistent_keepalive).filter(|k| *k > 0),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Domain,
    Ip,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    #[default]
    Proxy,
    Direct,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitRule {
    pub id: u32,
    pub client_id: ClientId,
    pub rule_type: RuleType,
    pub rule_value: String,
    #[serde(default)]
    pub action: RuleAction,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl SplitRule {
    pub fn normalized(self) -> Self {
        Self {
            rule_value: self.rule_value.trim().to_string(),
            ..self
        }
    }
}

/// What a split-tunnel rule string names
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleTarget {
    Network(IpNet),
    Domain(String),
    Invalid(String),
}

impl RuleTarget {
    /// Disambiguate a rule by shape: CIDR or bare address, else hostname
    pub fn classify(value: &str) -> Self {
        let value = value.trim();
        if let Ok(net) = value.parse::<IpNet>() {
            return RuleTarget::Network(net.trunc());
        }
        if let Ok(addr) = value.parse::<IpAddr>() {
            return RuleTarget::Network(IpNet::from(addr));
        }
        if is_hostname(value) {
            return RuleTarget::Domain(value.trim_end_matches('.').to_ascii_lowercase());
        }
        RuleTarget::Invalid(value.to_string())
    }
}

fn is_hostname(value: &str) -> bool {
    if value.is_empty() || value.len() > 253 || value.contains('/') {
        return false;
    }
    let labels: Vec<&str> = value.trim_end_matches('.').split('.').collect();
    let valid_labels = labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    });
    // all-numeric names are malformed addresses, not domains
    valid_labels && value.chars().any(|c| c.is_ascii_alphabetic())
}

/// Trim an optional string; blank becomes `None`
pub fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Trim every entry and drop the blank ones
pub fn normalize_list(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

fn default_true() -> bool {
    true
}

fn default_keepalive() -> u16 {
    25
}

fn default_mtu() -> u16 {
    1360
}
