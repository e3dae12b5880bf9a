//! In-memory stand-in for the host networking stack
//!
//! Keeps just enough kernel state (interfaces, fwmark rules, routes,
//! chains, sets) to answer the same "already exists"/"does not exist"
//! conditions the real tools report, and logs every call.

use super::{
    Family, FilterRule, FilterTable, FwmarkRule, IpSets, KernelParams, LinkControl,
    NameResolver, PacketFilter, Platform, PlatformError, PolicyRoutes,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

const BUILTIN_CHAINS: [&str; 2] = ["PREROUTING", "POSTROUTING"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelState {
    pub links: BTreeSet<String>,
    pub rules: Vec<(Family, FwmarkRule)>,
    pub routes: BTreeMap<(Family, u32), BTreeSet<(String, String)>>,
    pub chains: BTreeMap<(Family, &'static str, String), Vec<FilterRule>>,
    pub sets: BTreeMap<String, (Family, BTreeSet<String>)>,
    pub sysctl: BTreeMap<String, String>,
}

impl KernelState {
    pub fn chain(&self, family: Family, table: FilterTable, chain: &str) -> Option<&Vec<FilterRule>> {
        self.chains.get(&(family, table.as_str(), chain.to_string()))
    }

    pub fn set(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.sets.get(name).map(|(_, entries)| entries)
    }

    /// Anything at all that mentions `needle`
    pub fn mentions(&self, needle: &str) -> bool {
        self.links.iter().any(|l| l.contains(needle))
            || self
                .routes
                .values()
                .flatten()
                .any(|(_, iface)| iface.contains(needle))
            || self.chains.iter().any(|((_, _, name), rules)| {
                name.contains(needle)
                    || rules
                        .iter()
                        .any(|r| r.args().iter().any(|a| a.contains(needle)))
            })
            || self.sets.keys().any(|s| s.contains(needle))
    }
}

#[derive(Debug, Default)]
struct FakeState {
    kernel: KernelState,
    log: Vec<String>,
    resolver: HashMap<String, Vec<IpAddr>>,
    failing: HashSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeNetwork {
    inner: Arc<Mutex<FakeState>>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        let fake = Self::default();
        {
            let mut state = fake.lock();
            for family in Family::ALL {
                state
                    .kernel
                    .chains
                    .insert((family, "mangle", "PREROUTING".into()), Vec::new());
                state
                    .kernel
                    .chains
                    .insert((family, "nat", "POSTROUTING".into()), Vec::new());
            }
        }
        fake
    }

    pub fn platform(&self) -> Platform {
        Platform {
            links: Box::new(self.clone()),
            routes: Box::new(self.clone()),
            filter: Box::new(self.clone()),
            sets: Box::new(self.clone()),
            resolver: Box::new(self.clone()),
            sysctl: Box::new(self.clone()),
        }
    }

    pub fn resolve_to(&self, domain: &str, addrs: &[&str]) {
        let addrs = addrs.iter().filter_map(|a| a.parse().ok()).collect();
        self.lock().resolver.insert(domain.to_string(), addrs);
    }

    /// Make every command whose log line equals `command` fail
    pub fn fail(&self, command: &str) {
        self.lock().failing.insert(command.to_string());
    }

    pub fn kernel(&self) -> KernelState {
        self.lock().kernel.clone()
    }

    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    /// Drop a set behind the engine's back, as an external `ipset destroy` would
    pub fn lose_set(&self, name: &str) {
        self.lock().kernel.sets.remove(name);
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, line: String) -> Result<MutexGuard<'_, FakeState>, PlatformError> {
        let mut state = self.lock();
        state.log.push(line.clone());
        if state.failing.contains(&line) {
            return Err(PlatformError::CommandFailed {
                command: line,
                stderr: "injected failure".into(),
            });
        }
        Ok(state)
    }
}

fn interface_of(config: &Path) -> String {
    config
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn family_tag(family: Family) -> &'static str {
    match family {
        Family::V4 => "-4",
        Family::V6 => "-6",
    }
}

impl LinkControl for FakeNetwork {
    fn up(&self, config: &Path) -> Result<(), PlatformError> {
        let iface = interface_of(config);
        let mut state = self.record(format!("link up {iface}"))?;
        if !config.exists() {
            return Err(PlatformError::Absent(config.display().to_string()));
        }
        if !state.kernel.links.insert(iface.clone()) {
            return Err(PlatformError::AlreadyPresent(iface));
        }
        Ok(())
    }

    fn down(&self, config: &Path) -> Result<(), PlatformError> {
        let iface = interface_of(config);
        let mut state = self.record(format!("link down {iface}"))?;
        if !state.kernel.links.remove(&iface) {
            return Err(PlatformError::Absent(iface));
        }
        state.kernel.routes.retain(|_, routes| {
            routes.retain(|(_, dev)| *dev != iface);
            !routes.is_empty()
        });
        Ok(())
    }

    fn exists(&self, interface: &str) -> Result<bool, PlatformError> {
        let state = self.record(format!("link show {interface}"))?;
        Ok(state.kernel.links.contains(interface))
    }
}

impl PolicyRoutes for FakeNetwork {
    fn add_rule(&self, family: Family, rule: &FwmarkRule) -> Result<(), PlatformError> {
        let mut state = self.record(format!(
            "rule {} add fwmark {} table {} priority {}",
            family_tag(family),
            rule.mark,
            rule.table,
            rule.priority
        ))?;
        state.kernel.rules.push((family, *rule));
        state.kernel.rules.sort();
        Ok(())
    }

    fn delete_rule(&self, family: Family, rule: &FwmarkRule) -> Result<(), PlatformError> {
        let mut state = self.record(format!(
            "rule {} delete fwmark {} table {} priority {}",
            family_tag(family),
            rule.mark,
            rule.table,
            rule.priority
        ))?;
        let position = state
            .kernel
            .rules
            .iter()
            .position(|(f, r)| *f == family && r == rule);
        match position {
            Some(idx) => {
                state.kernel.rules.remove(idx);
                Ok(())
            }
            None => Err(PlatformError::Absent(format!("rule fwmark {}", rule.mark))),
        }
    }

    fn flush_table(&self, family: Family, table: u32) -> Result<(), PlatformError> {
        let mut state = self.record(format!("route {} flush table {}", family_tag(family), table))?;
        match state.kernel.routes.remove(&(family, table)) {
            Some(_) => Ok(()),
            None => Err(PlatformError::Absent(format!("table {table}"))),
        }
    }

    fn replace_route(
        &self,
        family: Family,
        table: u32,
        network: &str,
        interface: &str,
    ) -> Result<(), PlatformError> {
        let mut state = self.record(format!(
            "route {} replace table {} {} dev {}",
            family_tag(family),
            table,
            network,
            interface
        ))?;
        if !state.kernel.links.contains(interface) {
            return Err(PlatformError::Absent(interface.to_string()));
        }
        let routes = state.kernel.routes.entry((family, table)).or_default();
        routes.retain(|(net, _)| net != network);
        routes.insert((network.to_string(), interface.to_string()));
        Ok(())
    }
}

impl PacketFilter for FakeNetwork {
    fn create_chain(
        &self,
        family: Family,
        table: FilterTable,
        chain: &str,
    ) -> Result<(), PlatformError> {
        let mut state = self.record(format!("filter {} -t {} -N {}", family_tag(family), table.as_str(), chain))?;
        let key = (family, table.as_str(), chain.to_string());
        if state.kernel.chains.contains_key(&key) {
            return Err(PlatformError::AlreadyPresent(chain.to_string()));
        }
        state.kernel.chains.insert(key, Vec::new());
        Ok(())
    }

    fn flush_chain(
        &self,
        family: Family,
        table: FilterTable,
        chain: &str,
    ) -> Result<(), PlatformError> {
        let mut state = self.record(format!("filter {} -t {} -F {}", family_tag(family), table.as_str(), chain))?;
        match state
            .kernel
            .chains
            .get_mut(&(family, table.as_str(), chain.to_string()))
        {
            Some(rules) => {
                rules.clear();
                Ok(())
            }
            None => Err(PlatformError::Absent(chain.to_string())),
        }
    }

    fn delete_chain(
        &self,
        family: Family,
        table: FilterTable,
        chain: &str,
    ) -> Result<(), PlatformError> {
        let mut state = self.record(format!("filter {} -t {} -X {}", family_tag(family), table.as_str(), chain))?;
        let key = (family, table.as_str(), chain.to_string());
        let Some(rules) = state.kernel.chains.get(&key) else {
            return Err(PlatformError::Absent(chain.to_string()));
        };
        let referenced = state.kernel.chains.values().flatten().any(|r| {
            matches!(r, FilterRule::Jump { chain: target, .. } if target == chain)
        });
        if !rules.is_empty() || referenced || BUILTIN_CHAINS.contains(&chain) {
            return Err(PlatformError::CommandFailed {
                command: format!("-X {chain}"),
                stderr: "Directory not empty".into(),
            });
        }
        state.kernel.chains.remove(&key);
        Ok(())
    }

    fn append(
        &self,
        family: Family,
        table: FilterTable,
        chain: &str,
        rule: &FilterRule,
    ) -> Result<(), PlatformError> {
        let mut state = self.record(format!(
            "filter {} -t {} -A {} {}",
            family_tag(family),
            table.as_str(),
            chain,
            rule.args().join(" ")
        ))?;
        let missing_set = match rule {
            FilterRule::ReturnIfDestIn { set } | FilterRule::MarkIfDestIn { set, .. } => {
                (!state.kernel.sets.contains_key(set)).then(|| set.clone())
            }
            _ => None,
        };
        if let Some(set) = missing_set {
            return Err(PlatformError::Absent(set));
        }
        match state
            .kernel
            .chains
            .get_mut(&(family, table.as_str(), chain.to_string()))
        {
            Some(rules) => {
                rules.push(rule.clone());
                Ok(())
            }
            None => Err(PlatformError::Absent(chain.to_string())),
        }
    }

    fn delete(
        &self,
        family: Family,
        table: FilterTable,
        chain: &str,
        rule: &FilterRule,
    ) -> Result<(), PlatformError> {
        let mut state = self.record(format!(
            "filter {} -t {} -D {} {}",
            family_tag(family),
            table.as_str(),
            chain,
            rule.args().join(" ")
        ))?;
        let rules = state
            .kernel
            .chains
            .get_mut(&(family, table.as_str(), chain.to_string()))
            .ok_or_else(|| PlatformError::Absent(chain.to_string()))?;
        match rules.iter().position(|r| r == rule) {
            Some(idx) => {
                rules.remove(idx);
                Ok(())
            }
            None => Err(PlatformError::Absent(format!("rule in {chain}"))),
        }
    }
}

impl IpSets for FakeNetwork {
    fn create(&self, name: &str, family: Family) -> Result<(), PlatformError> {
        let mut state = self.record(format!("ipset create {} {}", name, family.ipset_family()))?;
        state
            .kernel
            .sets
            .entry(name.to_string())
            .or_insert_with(|| (family, BTreeSet::new()));
        Ok(())
    }

    fn flush(&self, name: &str) -> Result<(), PlatformError> {
        let mut state = self.record(format!("ipset flush {name}"))?;
        match state.kernel.sets.get_mut(name) {
            Some((_, entries)) => {
                entries.clear();
                Ok(())
            }
            None => Err(PlatformError::Absent(name.to_string())),
        }
    }

    fn add(&self, name: &str, entry: &str) -> Result<(), PlatformError> {
        let mut state = self.record(format!("ipset add {name} {entry}"))?;
        let (_, entries) = state
            .kernel
            .sets
            .get_mut(name)
            .ok_or_else(|| PlatformError::Absent(name.to_string()))?;
        if !entries.insert(entry.to_string()) {
            return Err(PlatformError::AlreadyPresent(entry.to_string()));
        }
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<(), PlatformError> {
        let mut state = self.record(format!("ipset destroy {name}"))?;
        let in_use = state.kernel.chains.values().flatten().any(|r| match r {
            FilterRule::ReturnIfDestIn { set } | FilterRule::MarkIfDestIn { set, .. } => {
                set == name
            }
            _ => false,
        });
        if in_use {
            return Err(PlatformError::CommandFailed {
                command: format!("ipset destroy {name}"),
                stderr: "Set cannot be destroyed: it is in use by a kernel component".into(),
            });
        }
        match state.kernel.sets.remove(name) {
            Some(_) => Ok(()),
            None => Err(PlatformError::Absent(name.to_string())),
        }
    }

    fn exists(&self, name: &str) -> Result<bool, PlatformError> {
        let state = self.record(format!("ipset list {name}"))?;
        Ok(state.kernel.sets.contains_key(name))
    }
}

impl KernelParams for FakeNetwork {
    fn set(&self, key: &str, value: &str) -> Result<(), PlatformError> {
        let mut state = self.record(format!("sysctl {key}={value}"))?;
        state.kernel.sysctl.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

impl NameResolver for FakeNetwork {
    fn lookup(&self, domain: &str) -> Result<Vec<IpAddr>, PlatformError> {
        let state = self.record(format!("getent ahosts {domain}"))?;
        match state.resolver.get(domain) {
            Some(addrs) => Ok(addrs.clone()),
            None => Err(PlatformError::Absent(domain.to_string())),
        }
    }
}
