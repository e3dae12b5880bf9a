//! Host networking capabilities
//!
//! Each external tool family sits behind its own narrow trait so that the
//! engine can be driven against a recording fake in tests. The Linux
//! implementation shells out to `wg-quick`, `ip`, `iptables`/`ip6tables`,
//! `ipset` and `getent`.

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(test)]
pub mod fake;

use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
    /// The object being removed or queried is not there
    #[error("{0}: does not exist")]
    Absent(String),
    /// The object being created is already there
    #[error("{0}: already exists")]
    AlreadyPresent(String),
    #[error("Failed to run {program}: {source}")]
    SpawnError {
        program: String,
        source: std::io::Error,
    },
    #[error("{command} timed out after {secs}s")]
    Timeout { command: String, secs: u64 },
    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

impl PlatformError {
    pub fn is_absent(&self) -> bool {
        matches!(self, PlatformError::Absent(_))
    }

    pub fn is_already_present(&self) -> bool {
        matches!(self, PlatformError::AlreadyPresent(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub const ALL: [Family; 2] = [Family::V4, Family::V6];

    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// Network strings carry a colon only when they are IPv6
    pub fn of_network(network: &str) -> Self {
        if network.contains(':') {
            Family::V6
        } else {
            Family::V4
        }
    }

    /// `ipset` family keyword
    pub fn ipset_family(self) -> &'static str {
        match self {
            Family::V4 => "inet",
            Family::V6 => "inet6",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => write!(f, "ipv4"),
            Family::V6 => write!(f, "ipv6"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterTable {
    Mangle,
    Nat,
}

impl FilterTable {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterTable::Mangle => "mangle",
            FilterTable::Nat => "nat",
        }
    }
}

/// Firewall rules the engine ever installs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterRule {
    /// Send packets from `source` into `chain`
    Jump { source: String, chain: String },
    MarkAll { mark: u32 },
    /// Stop processing (leave unmarked) when the destination is in `set`
    ReturnIfDestIn { set: String },
    MarkIfDestIn { set: String, mark: u32 },
    Masquerade { out_interface: String },
}

impl FilterRule {
    /// Rule specification as iptables arguments, without the chain
    pub fn args(&self) -> Vec<String> {
        let args: Vec<&str> = match self {
            FilterRule::Jump { source, chain } => vec!["-s", source.as_str(), "-j", chain.as_str()],
            FilterRule::MarkAll { .. } => vec!["-j", "MARK", "--set-mark"],
            FilterRule::ReturnIfDestIn { set } => {
                vec!["-m", "set", "--match-set", set.as_str(), "dst", "-j", "RETURN"]
            }
            FilterRule::MarkIfDestIn { set, .. } => {
                vec!["-m", "set", "--match-set", set.as_str(), "dst", "-j", "MARK", "--set-mark"]
            }
            FilterRule::Masquerade { out_interface } => {
                vec!["-o", out_interface.as_str(), "-j", "MASQUERADE"]
            }
        };
        let mut args: Vec<String> = args.into_iter().map(String::from).collect();
        if let FilterRule::MarkAll { mark } | FilterRule::MarkIfDestIn { mark, .. } = self {
            args.push(mark.to_string());
        }
        args
    }
}

/// Policy rule selecting a routing table by firewall mark
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FwmarkRule {
    pub mark: u32,
    pub table: u32,
    pub priority: u32,
}

/// WireGuard interface lifecycle (`wg-quick`)
pub trait LinkControl: Send + Sync {
    fn up(&self, config: &Path) -> Result<(), PlatformError>;
    fn down(&self, config: &Path) -> Result<(), PlatformError>;
    fn exists(&self, interface: &str) -> Result<bool, PlatformError>;
}

/// Policy routing rules and per-table routes (`ip rule`, `ip route`)
pub trait PolicyRoutes: Send + Sync {
    fn add_rule(&self, family: Family, rule: &FwmarkRule) -> Result<(), PlatformError>;
    fn delete_rule(&self, family: Family, rule: &FwmarkRule) -> Result<(), PlatformError>;
    fn flush_table(&self, family: Family, table: u32) -> Result<(), PlatformError>;
    fn replace_route(
        &self,
        family: Family,
        table: u32,
        network: &str,
        interface: &str,
    ) -> Result<(), PlatformError>;
}

/// Netfilter chains and rules (`iptables`, `ip6tables`)
pub trait PacketFilter: Send + Sync {
    fn create_chain(&self, family: Family, table: FilterTable, chain: &str)
        -> Result<(), PlatformError>;
    fn flush_chain(&self, family: Family, table: FilterTable, chain: &str)
        -> Result<(), PlatformError>;
    fn delete_chain(&self, family: Family, table: FilterTable, chain: &str)
        -> Result<(), PlatformError>;
    fn append(
        &self,
        family: Family,
        table: FilterTable,
        chain: &str,
        rule: &FilterRule,
    ) -> Result<(), PlatformError>;
    fn delete(
        &self,
        family: Family,
        table: FilterTable,
        chain: &str,
        rule: &FilterRule,
    ) -> Result<(), PlatformError>;
}

/// Kernel IP sets (`ipset`)
pub trait IpSets: Send + Sync {
    /// Create a `hash:net` set, succeeding if it already exists
    fn create(&self, name: &str, family: Family) -> Result<(), PlatformError>;
    fn flush(&self, name: &str) -> Result<(), PlatformError>;
    fn add(&self, name: &str, entry: &str) -> Result<(), PlatformError>;
    fn destroy(&self, name: &str) -> Result<(), PlatformError>;
    fn exists(&self, name: &str) -> Result<bool, PlatformError>;
}

/// Kernel parameters (`sysctl`)
pub trait KernelParams: Send + Sync {
    fn set(&self, key: &str, value: &str) -> Result<(), PlatformError>;
}

/// System name resolution (`getent ahosts`)
pub trait NameResolver: Send + Sync {
    fn lookup(&self, domain: &str) -> Result<Vec<IpAddr>, PlatformError>;
}

/// The full set of capabilities a reconciliation pass needs
pub struct Platform {
    pub links: Box<dyn LinkControl>,
    pub routes: Box<dyn PolicyRoutes>,
    pub filter: Box<dyn PacketFilter>,
    pub sets: Box<dyn IpSets>,
    pub resolver: Box<dyn NameResolver>,
    pub sysctl: Box<dyn KernelParams>,
}

/// Get the host platform, bounding every external command by `timeout`
pub fn get_platform(timeout: Duration) -> Result<Platform, PlatformError> {
    #[cfg(target_os = "linux")]
    {
        let host = linux::LinuxNetwork::new(timeout);
        Ok(Platform {
            links: Box::new(host.clone()),
            routes: Box::new(host.clone()),
            filter: Box::new(host.clone()),
            sets: Box::new(host.clone()),
            resolver: Box::new(host.clone()),
            sysctl: Box::new(host),
        })
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = timeout;
        Err(PlatformError::UnsupportedPlatform)
    }
}
