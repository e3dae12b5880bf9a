//! Reconciliation of records into kernel routing state
//!
//! A pass loads the previous snapshot, tears down clients that disappeared,
//! brings shared relays up or down, then rebuilds every current client from
//! scratch. Client failures are isolated: a client that fails keeps only the
//! state it actually reached and the pass moves on. Only an unreadable or
//! unwritable state file fails the pass as a whole.

use super::allocator::{self, MAX_CLIENT_ID};
use super::chain::{ChainBuilder, ChainMode, ChainState};
use super::policy::PolicyRouting;
use super::resolver::DomainResolver;
use super::targets::{self, DomainTarget, TargetSets};
use super::upstream::{UpstreamError, UpstreamInterfaces};
use super::CleanupLog;
use crate::model::{Client, ClientId, RecordSet, SplitTunnelMode, UpstreamId, UpstreamServer};
use crate::platform::{Family, Platform, PlatformError};
use crate::state::{ClientSnapshot, RoutingState, StateError, StateStore, UpstreamSnapshot};
use crate::wireguard::RelayTunnel;
use ipnet::IpNet;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const MAX_INTERFACE_NAME: usize = 15;

/// Forwarding, plus loose reverse-path filtering so replies routed by
/// fwmark through a relay are not dropped
const KERNEL_PARAMS: [(&str, &str); 4] = [
    ("net.ipv4.ip_forward", "1"),
    ("net.ipv4.conf.all.src_valid_mark", "1"),
    ("net.ipv4.conf.all.rp_filter", "2"),
    ("net.ipv4.conf.default.rp_filter", "2"),
];

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    State(#[from] StateError),
}

/// Why a single client could not be fully provisioned
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("client id {0} is out of range (max {max})", max = MAX_CLIENT_ID)]
    InvalidId(ClientId),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("Failed to program policy routing: {0}")]
    Routing(PlatformError),
    #[error("Failed to install masquerade: {0}")]
    Masquerade(PlatformError),
    #[error("Failed to build {family} chain: {source}")]
    Chain {
        family: Family,
        source: PlatformError,
    },
    #[error("shared relay {0} is not up")]
    SharedRelayDown(UpstreamId),
}

/// How far a client got, from nothing to fully split
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClientStage {
    Absent,
    RelayOnly,
    SplitActive,
}

impl std::fmt::Display for ClientStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientStage::Absent => write!(f, "absent"),
            ClientStage::RelayOnly => write!(f, "relay-only"),
            ClientStage::SplitActive => write!(f, "split-active"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOutcome {
    pub id: ClientId,
    pub stage: ClientStage,
    pub interface: Option<String>,
    pub error: Option<String>,
}

impl ClientOutcome {
    fn new(id: ClientId) -> Self {
        Self {
            id,
            stage: ClientStage::Absent,
            interface: None,
            error: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamOutcome {
    pub id: UpstreamId,
    pub interface: String,
    pub up: bool,
    pub error: Option<String>,
}

/// Everything a pass did, for callers and operators
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub clients: Vec<ClientOutcome>,
    pub upstreams: Vec<UpstreamOutcome>,
    /// Removals that failed for a reason other than "not there"
    pub cleanup_failures: Vec<String>,
    pub domains: Vec<DomainTarget>,
}

impl SyncReport {
    pub fn client(&self, id: ClientId) -> Option<&ClientOutcome> {
        self.clients.iter().find(|c| c.id == id)
    }

    pub fn failed_clients(&self) -> impl Iterator<Item = &ClientOutcome> {
        self.clients.iter().filter(|c| !c.is_ok())
    }

    pub fn is_clean(&self) -> bool {
        self.failed_clients().next().is_none()
            && self.upstreams.iter().all(|u| u.error.is_none())
            && self.cleanup_failures.is_empty()
    }
}

/// Snapshot plus what the kernel says about each relay interface and set
#[derive(Debug, Clone, Default)]
pub struct StatusReport {
    pub state: RoutingState,
    /// Relay interface name -> currently present
    pub interfaces: BTreeMap<String, bool>,
    /// Target set name -> currently present
    pub sets: BTreeMap<String, bool>,
}

impl StatusReport {
    pub fn missing_interfaces(&self) -> Vec<&str> {
        absent(&self.interfaces)
    }

    pub fn missing_sets(&self) -> Vec<&str> {
        absent(&self.sets)
    }
}

fn absent(objects: &BTreeMap<String, bool>) -> Vec<&str> {
    objects
        .iter()
        .filter(|(_, present)| !**present)
        .map(|(name, _)| name.as_str())
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub missing: Vec<String>,
    /// The repair pass, when one was needed
    pub resync: Option<SyncReport>,
}

enum Route {
    /// No relay; the client routes like any other
    None,
    Dedicated(RelayTunnel),
    Shared {
        id: UpstreamId,
        interface: String,
        allowed_ips: Vec<String>,
    },
}

/// Owns the kernel routing state of one host
pub struct Reconciler {
    platform: Platform,
    store: StateStore,
    upstream_dir: PathBuf,
}

impl Reconciler {
    pub fn new(platform: Platform, store: StateStore, upstream_dir: impl Into<PathBuf>) -> Self {
        Self {
            platform,
            store,
            upstream_dir: upstream_dir.into(),
        }
    }

    fn upstreams(&self) -> UpstreamInterfaces<'_> {
        UpstreamInterfaces::new(self.platform.links.as_ref())
    }

    fn policy(&self) -> PolicyRouting<'_> {
        PolicyRouting::new(self.platform.routes.as_ref(), self.platform.filter.as_ref())
    }

    fn chains(&self) -> ChainBuilder<'_> {
        ChainBuilder::new(self.platform.filter.as_ref(), self.platform.sets.as_ref())
    }

    /// Bring the kernel in line with `records`
    pub fn sync(&self, records: &RecordSet) -> Result<SyncReport, SyncError> {
        let records = records.clone().normalized();
        let previous = self.store.load()?;
        let mut cleanup = CleanupLog::new();
        let mut report = SyncReport::default();
        self.ensure_kernel_params();

        let clients = unique_clients(&records);
        let current: BTreeSet<ClientId> = clients.iter().map(|c| c.id).collect();

        for (id, snapshot) in &previous.clients {
            if !current.contains(id) {
                info!("Client {} removed, tearing down", id);
                self.teardown_client(*id, &snapshot.addresses(), &mut cleanup);
            }
        }

        let (upstreams, outcomes) = self.sync_shared(&records, &previous, &mut cleanup);
        report.upstreams = outcomes;

        let mut next = RoutingState {
            clients: BTreeMap::new(),
            upstreams,
        };
        for client in clients {
            let (snapshot, outcome, domains) = self.apply_client(
                client,
                &records,
                previous.clients.get(&client.id),
                &next.upstreams,
                &mut cleanup,
            );
            match &outcome.error {
                Some(e) => error!("Client {}: {} ({})", client.id, e, outcome.stage),
                None => info!("Client {}: {}", client.id, outcome.stage),
            }
            if let Some(snapshot) = snapshot {
                next.clients.insert(client.id, snapshot);
            }
            report.clients.push(outcome);
            report.domains.extend(domains);
        }

        self.store.save(&next)?;
        report.cleanup_failures = cleanup.into_failures();
        Ok(report)
    }

    /// Remove every client and shared relay the snapshot knows about
    pub fn teardown_all(&self) -> Result<Vec<String>, SyncError> {
        let previous = self.store.load()?;
        let mut cleanup = CleanupLog::new();
        for (id, snapshot) in &previous.clients {
            self.teardown_client(*id, &snapshot.addresses(), &mut cleanup);
        }
        for upstream in previous.upstreams.values() {
            self.teardown_shared(upstream, &mut cleanup);
        }
        self.store.save(&RoutingState::default())?;
        Ok(cleanup.into_failures())
    }

    pub fn status(&self) -> Result<StatusReport, SyncError> {
        let state = self.store.load()?;
        let names: BTreeSet<String> = state
            .clients
            .values()
            .filter_map(|c| c.upstream_interface.clone())
            .chain(state.upstreams.values().map(|u| u.interface_name.clone()))
            .collect();

        let mut interfaces = BTreeMap::new();
        for name in names {
            let up = self.upstreams().is_up(&name).unwrap_or_else(|e| {
                warn!("Failed to query {}: {}", name, e);
                false
            });
            interfaces.insert(name, up);
        }

        let set_names: BTreeSet<String> = state
            .clients
            .values()
            .flat_map(|c| {
                [&c.proxy_set4, &c.proxy_set6, &c.direct_set4, &c.direct_set6]
                    .into_iter()
                    .flatten()
                    .cloned()
            })
            .collect();
        let mut sets = BTreeMap::new();
        for name in set_names {
            let present = self.platform.sets.exists(&name).unwrap_or_else(|e| {
                warn!("Failed to query set {}: {}", name, e);
                false
            });
            sets.insert(name, present);
        }

        Ok(StatusReport {
            state,
            interfaces,
            sets,
        })
    }

    /// Re-run a pass when any recorded relay interface or target set has
    /// gone missing
    pub fn health(&self, records: &RecordSet) -> Result<HealthReport, SyncError> {
        let status = self.status()?;
        let missing: Vec<String> = status
            .missing_interfaces()
            .into_iter()
            .chain(status.missing_sets())
            .map(String::from)
            .collect();
        if missing.is_empty() {
            debug!("All relay interfaces and target sets present");
            return Ok(HealthReport::default());
        }

        warn!("Missing relay state: {}", missing.join(", "));
        let resync = self.sync(records)?;
        Ok(HealthReport {
            missing,
            resync: Some(resync),
        })
    }

    fn sync_shared(
        &self,
        records: &RecordSet,
        previous: &RoutingState,
        cleanup: &mut CleanupLog,
    ) -> (BTreeMap<UpstreamId, UpstreamSnapshot>, Vec<UpstreamOutcome>) {
        let mut by_id: BTreeMap<UpstreamId, &UpstreamServer> = BTreeMap::new();
        for upstream in records.upstreams.iter().filter(|u| u.enabled) {
            if by_id.insert(upstream.id, upstream).is_some() {
                warn!("Duplicate upstream id {}, using the last record", upstream.id);
            }
        }

        // one relay per interface; later ids sharing a name are rejected
        let mut wanted: BTreeMap<UpstreamId, &UpstreamServer> = BTreeMap::new();
        let mut owners: BTreeMap<&str, UpstreamId> = BTreeMap::new();
        let mut outcomes = Vec::new();
        for (id, upstream) in by_id {
            if let Some(owner) = owners.get(upstream.interface_name.as_str()) {
                let e = format!(
                    "interface {} is already used by shared relay {}",
                    upstream.interface_name, owner
                );
                error!("Shared relay {}: {}", id, e);
                outcomes.push(UpstreamOutcome {
                    id,
                    interface: upstream.interface_name.clone(),
                    up: false,
                    error: Some(e),
                });
                continue;
            }
            owners.insert(upstream.interface_name.as_str(), id);
            wanted.insert(id, upstream);
        }

        for (id, snapshot) in &previous.upstreams {
            let keep = wanted
                .get(id)
                .is_some_and(|u| u.interface_name == snapshot.interface_name);
            if !keep {
                info!("Shared relay {} ({}) removed", id, snapshot.interface_name);
                self.teardown_shared(snapshot, cleanup);
            }
        }

        let mut up = BTreeMap::new();
        for (id, upstream) in wanted {
            let config_path =
                allocator::interface_config_path(&self.upstream_dir, &upstream.interface_name);
            let snapshot = UpstreamSnapshot {
                id,
                interface_name: upstream.interface_name.clone(),
                config_path: config_path.display().to_string(),
            };
            let result = self.ensure_shared(upstream, &config_path, cleanup);
            if let Err(e) = &result {
                error!("Shared relay {} ({}): {}", id, upstream.interface_name, e);
                if valid_interface_name(&upstream.interface_name) {
                    self.teardown_shared(&snapshot, cleanup);
                }
            }
            outcomes.push(UpstreamOutcome {
                id,
                interface: upstream.interface_name.clone(),
                up: result.is_ok(),
                error: result.err(),
            });
            if outcomes.last().is_some_and(|o| o.up) {
                up.insert(id, snapshot);
            }
        }
        (up, outcomes)
    }

    fn ensure_shared(
        &self,
        upstream: &UpstreamServer,
        config_path: &Path,
        cleanup: &mut CleanupLog,
    ) -> Result<(), String> {
        if !valid_interface_name(&upstream.interface_name) {
            return Err(format!("invalid interface name {:?}", upstream.interface_name));
        }
        let relay = upstream.relay().map_err(|e| e.to_string())?;
        self.upstreams()
            .ensure(&relay, config_path)
            .map_err(|e| e.to_string())?;
        self.loosen_rp_filter(&upstream.interface_name);
        self.policy()
            .masquerade(&upstream.interface_name, cleanup)
            .map_err(|e| format!("Failed to install masquerade: {e}"))
    }

    fn teardown_shared(&self, snapshot: &UpstreamSnapshot, cleanup: &mut CleanupLog) {
        self.policy().unmasquerade(&snapshot.interface_name, cleanup);
        self.upstreams()
            .teardown(Path::new(&snapshot.config_path), cleanup);
    }

    fn route_for(
        &self,
        client: &Client,
        records: &RecordSet,
        shared: &BTreeMap<UpstreamId, UpstreamSnapshot>,
    ) -> Result<Route, ClientError> {
        if !client.enabled {
            return Ok(Route::None);
        }
        let upstream = client.upstream();
        if let Some(relay) = upstream.relay() {
            return Ok(Route::Dedicated(relay));
        }
        if upstream.enabled && !upstream.is_complete() {
            warn!("Client {}: relay enabled but incomplete, skipping it", client.id);
        }
        let Some(upstream_id) = client.shared_upstream_id else {
            return Ok(Route::None);
        };
        match (shared.get(&upstream_id), records.upstream(upstream_id)) {
            (Some(snapshot), Some(upstream)) => Ok(Route::Shared {
                id: upstream_id,
                interface: snapshot.interface_name.clone(),
                allowed_ips: upstream.allowed_ips.clone(),
            }),
            (None, Some(upstream)) if upstream.enabled => {
                Err(ClientError::SharedRelayDown(upstream_id))
            }
            _ => {
                debug!(
                    "Client {}: shared relay {} is not active",
                    client.id, upstream_id
                );
                Ok(Route::None)
            }
        }
    }

    fn apply_client(
        &self,
        client: &Client,
        records: &RecordSet,
        previous: Option<&ClientSnapshot>,
        shared: &BTreeMap<UpstreamId, UpstreamSnapshot>,
        cleanup: &mut CleanupLog,
    ) -> (Option<ClientSnapshot>, ClientOutcome, Vec<DomainTarget>) {
        let id = client.id;
        let mut outcome = ClientOutcome::new(id);
        if !allocator::is_valid_id(id) {
            outcome.error = Some(ClientError::InvalidId(id).to_string());
            return (None, outcome, Vec::new());
        }

        let mut snapshot = ClientSnapshot {
            ipv4_address: source_address(&client.ipv4_address, Family::V4),
            ipv6_address: source_address(&client.ipv6_address, Family::V6),
            ..ClientSnapshot::absent(id, allocator::mark(id), allocator::table(id))
        };
        let current = snapshot.addresses();
        let stale: Vec<&str> = previous
            .map(|p| p.addresses())
            .unwrap_or_default()
            .into_iter()
            .filter(|a| !current.contains(a))
            .collect();

        let route = match self.route_for(client, records, shared) {
            Ok(route) => route,
            Err(e) => {
                outcome.error = Some(e.to_string());
                Route::None
            }
        };
        if let Route::None = route {
            let mut sources = current.clone();
            sources.extend(&stale);
            self.teardown_client(id, &sources, cleanup);
            return (Some(snapshot.clone()), outcome, Vec::new());
        }

        let mut domains = Vec::new();
        let result = self.provision(
            client,
            records,
            route,
            &stale,
            &mut snapshot,
            &mut outcome,
            &mut domains,
            cleanup,
        );
        if let Err(e) = result {
            outcome.error = Some(e.to_string());
        }
        (Some(snapshot), outcome, domains)
    }

    #[allow(clippy::too_many_arguments)]
    fn provision(
        &self,
        client: &Client,
        records: &RecordSet,
        route: Route,
        stale: &[&str],
        snapshot: &mut ClientSnapshot,
        outcome: &mut ClientOutcome,
        domains: &mut Vec<DomainTarget>,
        cleanup: &mut CleanupLog,
    ) -> Result<(), ClientError> {
        let id = client.id;
        let (interface, allowed_ips, dedicated) = match route {
            Route::None => return Ok(()),
            Route::Dedicated(relay) => {
                let path = allocator::config_path(&self.upstream_dir, id);
                self.upstreams().ensure(&relay, &path)?;
                snapshot.upstream_config_path = Some(path.display().to_string());
                let interface = allocator::interface_name(id);
                self.loosen_rp_filter(&interface);
                (interface, relay.allowed_ips, true)
            }
            Route::Shared {
                id: upstream_id,
                interface,
                allowed_ips,
            } => {
                self.teardown_dedicated(id, cleanup);
                snapshot.shared_upstream_id = Some(upstream_id);
                (interface, allowed_ips, false)
            }
        };
        snapshot.upstream_interface = Some(interface.clone());
        outcome.interface = Some(interface.clone());

        self.policy()
            .ensure(id, &interface, &allowed_ips, cleanup)
            .map_err(ClientError::Routing)?;
        if dedicated {
            self.policy()
                .masquerade(&interface, cleanup)
                .map_err(ClientError::Masquerade)?;
        }
        outcome.stage = ClientStage::RelayOnly;

        let split = client.split_tunnel();
        let targets = if split.mode == SplitTunnelMode::Custom {
            let rules = targets::collect_rules(client, records.rules_for(id));
            domains.extend(targets::domain_targets(id, &rules));
            let resolver = DomainResolver::new(self.platform.resolver.as_ref());
            targets::resolve_targets(&rules, &resolver)
        } else {
            TargetSets::default()
        };
        let mode = match split.mode {
            SplitTunnelMode::Direct => ChainMode::None,
            SplitTunnelMode::Upstream => ChainMode::MarkAll,
            SplitTunnelMode::Custom => ChainMode::Selective(&targets),
        };

        let chains = self.chains();
        for family in Family::ALL {
            let source = match family {
                Family::V4 => snapshot.ipv4_address.clone(),
                Family::V6 => snapshot.ipv6_address.clone(),
            };
            let state = chains
                .apply(id, family, source.as_deref(), mode, stale, cleanup)
                .map_err(|source| ClientError::Chain { family, source })?;
            record_chain(snapshot, family, state);
        }

        if snapshot.chain4.is_some() || snapshot.chain6.is_some() {
            outcome.stage = ClientStage::SplitActive;
        }
        Ok(())
    }

    fn ensure_kernel_params(&self) {
        for (key, value) in KERNEL_PARAMS {
            if let Err(e) = self.platform.sysctl.set(key, value) {
                warn!("Failed to set {}={}: {}", key, value, e);
            }
        }
    }

    fn loosen_rp_filter(&self, interface: &str) {
        // sysctl keys separate on '.', so dots inside the name become '/'
        let key = format!("net.ipv4.conf.{}.rp_filter", interface.replace('.', "/"));
        if let Err(e) = self.platform.sysctl.set(&key, "2") {
            warn!("Failed to set {}=2: {}", key, e);
        }
    }

    /// Full teardown by derived names, so it works without a snapshot
    fn teardown_client(&self, id: ClientId, sources: &[&str], cleanup: &mut CleanupLog) {
        if !allocator::is_valid_id(id) {
            return;
        }
        self.chains().teardown(id, sources, cleanup);
        self.policy().teardown(id, cleanup);
        self.teardown_dedicated(id, cleanup);
    }

    fn teardown_dedicated(&self, id: ClientId, cleanup: &mut CleanupLog) {
        self.policy()
            .unmasquerade(&allocator::interface_name(id), cleanup);
        self.upstreams()
            .teardown(&allocator::config_path(&self.upstream_dir, id), cleanup);
    }
}

/// Domain rules of every client that would run split, without touching
/// the kernel
pub fn domain_map(records: &RecordSet) -> Vec<DomainTarget> {
    let records = records.clone().normalized();
    unique_clients(&records)
        .into_iter()
        .filter(|c| c.enabled && allocator::is_valid_id(c.id))
        .filter(|c| c.split_tunnel().mode == SplitTunnelMode::Custom)
        .filter(|c| {
            c.upstream().relay().is_some()
                || c.shared_upstream_id
                    .and_then(|id| records.upstream(id))
                    .is_some_and(|u| u.enabled)
        })
        .flat_map(|c| {
            let rules = targets::collect_rules(c, records.rules_for(c.id));
            targets::domain_targets(c.id, &rules)
        })
        .collect()
}

fn unique_clients(records: &RecordSet) -> Vec<&Client> {
    let mut seen = BTreeSet::new();
    records
        .clients
        .iter()
        .filter(|c| {
            let first = seen.insert(c.id);
            if !first {
                warn!("Duplicate client id {}, ignoring later record", c.id);
            }
            first
        })
        .collect()
}

fn record_chain(snapshot: &mut ClientSnapshot, family: Family, state: ChainState) {
    match family {
        Family::V4 => {
            snapshot.chain4 = state.chain;
            snapshot.proxy_set4 = state.proxy_set;
            snapshot.direct_set4 = state.direct_set;
        }
        Family::V6 => {
            snapshot.chain6 = state.chain;
            snapshot.proxy_set6 = state.proxy_set;
            snapshot.direct_set6 = state.direct_set;
        }
    }
}

/// A tunnel address usable as an iptables `-s` match for `family`
fn source_address(value: &str, family: Family) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let matches = match value.parse::<IpAddr>() {
        Ok(addr) => Family::of(&addr) == family,
        Err(_) => match value.parse::<IpNet>() {
            Ok(IpNet::V4(_)) => family == Family::V4,
            Ok(IpNet::V6(_)) => family == Family::V6,
            Err(_) => false,
        },
    };
    if !matches {
        warn!("Ignoring {} address {:?}", family, value);
        return None;
    }
    Some(value.to_string())
}

fn valid_interface_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_INTERFACE_NAME
        && !name.starts_with("wg-up-")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}
