//! Per-client packet-marking chains in the mangle table
//!
//! Each client gets one chain per address family, jumped to from
//! `PREROUTING` for packets sourced from the client's tunnel address.
//! Marked packets are later matched by the client's fwmark rule.

use super::allocator::{self, SetRole};
use super::ipset::IpSetSync;
use super::targets::TargetSets;
use super::CleanupLog;
use crate::model::ClientId;
use crate::platform::{Family, FilterRule, FilterTable, IpSets, PacketFilter, PlatformError};
use tracing::debug;

const PREROUTING: &str = "PREROUTING";

/// How a client's packets are marked
#[derive(Debug, Clone, Copy)]
pub enum ChainMode<'t> {
    /// No chain and no sets
    None,
    /// Mark everything the client sends
    MarkAll,
    /// Mark only destinations in the proxy set, unless also in the direct set
    Selective(&'t TargetSets),
}

/// What a family ended up with after a chain pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainState {
    pub chain: Option<String>,
    pub proxy_set: Option<String>,
    pub direct_set: Option<String>,
}

pub struct ChainBuilder<'a> {
    filter: &'a dyn PacketFilter,
    sets: IpSetSync<'a>,
}

impl<'a> ChainBuilder<'a> {
    pub fn new(filter: &'a dyn PacketFilter, sets: &'a dyn IpSets) -> Self {
        Self {
            filter,
            sets: IpSetSync::new(sets),
        }
    }

    /// Rebuild one family's chain for `id` from scratch
    ///
    /// `stale_sources` are earlier tunnel addresses whose jumps must go too.
    /// Without a `source` address the family is only torn down.
    pub fn apply(
        &self,
        id: ClientId,
        family: Family,
        source: Option<&str>,
        mode: ChainMode<'_>,
        stale_sources: &[&str],
        cleanup: &mut CleanupLog,
    ) -> Result<ChainState, PlatformError> {
        let chain = allocator::chain_name(id, family);
        let mut sources: Vec<&str> = stale_sources.to_vec();
        if let Some(source) = source {
            if !sources.contains(&source) {
                sources.push(source);
            }
        }
        self.remove_chain(&chain, family, &sources, cleanup);

        let Some(source) = source else {
            self.destroy_sets(id, family, cleanup);
            return Ok(ChainState::default());
        };

        match mode {
            ChainMode::None => {
                self.destroy_sets(id, family, cleanup);
                Ok(ChainState::default())
            }
            ChainMode::MarkAll => {
                self.destroy_sets(id, family, cleanup);
                self.install(&chain, family, source)?;
                self.filter.append(
                    family,
                    FilterTable::Mangle,
                    &chain,
                    &FilterRule::MarkAll {
                        mark: allocator::mark(id),
                    },
                )?;
                debug!("Client {}: {} marks all traffic", id, chain);
                Ok(ChainState {
                    chain: Some(chain),
                    ..ChainState::default()
                })
            }
            ChainMode::Selective(targets) => self.selective(id, family, source, targets, cleanup),
        }
    }

    fn selective(
        &self,
        id: ClientId,
        family: Family,
        source: &str,
        targets: &TargetSets,
        cleanup: &mut CleanupLog,
    ) -> Result<ChainState, PlatformError> {
        if targets.is_empty(family) {
            debug!("Client {}: no {} targets, chain left out", id, family);
            self.destroy_sets(id, family, cleanup);
            return Ok(ChainState::default());
        }

        let mut state = ChainState::default();
        for role in SetRole::ALL {
            let name = allocator::set_name(id, role, family);
            let entries = targets.get(role, family);
            if entries.is_empty() {
                self.sets.destroy(&name, cleanup);
                continue;
            }
            self.sets.sync(&name, family, entries)?;
            match role {
                SetRole::Proxy => state.proxy_set = Some(name),
                SetRole::Direct => state.direct_set = Some(name),
            }
        }

        let chain = allocator::chain_name(id, family);
        self.install(&chain, family, source)?;
        // direct must be matched before proxy so it wins on overlap
        if let Some(set) = &state.direct_set {
            self.filter.append(
                family,
                FilterTable::Mangle,
                &chain,
                &FilterRule::ReturnIfDestIn { set: set.clone() },
            )?;
        }
        if let Some(set) = &state.proxy_set {
            self.filter.append(
                family,
                FilterTable::Mangle,
                &chain,
                &FilterRule::MarkIfDestIn {
                    set: set.clone(),
                    mark: allocator::mark(id),
                },
            )?;
        }
        state.chain = Some(chain);
        Ok(state)
    }

    /// Remove chains and sets for both families
    pub fn teardown(&self, id: ClientId, sources: &[&str], cleanup: &mut CleanupLog) {
        for family in Family::ALL {
            let chain = allocator::chain_name(id, family);
            self.remove_chain(&chain, family, sources, cleanup);
            self.destroy_sets(id, family, cleanup);
        }
    }

    fn install(&self, chain: &str, family: Family, source: &str) -> Result<(), PlatformError> {
        match self.filter.create_chain(family, FilterTable::Mangle, chain) {
            Ok(()) => {}
            Err(e) if e.is_already_present() => {
                self.filter.flush_chain(family, FilterTable::Mangle, chain)?;
            }
            Err(e) => return Err(e),
        }
        self.filter.append(
            family,
            FilterTable::Mangle,
            PREROUTING,
            &FilterRule::Jump {
                source: source.to_string(),
                chain: chain.to_string(),
            },
        )
    }

    fn remove_chain(&self, chain: &str, family: Family, sources: &[&str], cleanup: &mut CleanupLog) {
        for source in sources.iter().filter(|s| Family::of_network(s) == family) {
            let jump = FilterRule::Jump {
                source: source.to_string(),
                chain: chain.to_string(),
            };
            cleanup.record(
                format!("remove {family} jump {source} -> {chain}"),
                self.filter.delete(family, FilterTable::Mangle, PREROUTING, &jump),
            );
        }
        cleanup.record(
            format!("flush {family} chain {chain}"),
            self.filter.flush_chain(family, FilterTable::Mangle, chain),
        );
        cleanup.record(
            format!("delete {family} chain {chain}"),
            self.filter.delete_chain(family, FilterTable::Mangle, chain),
        );
    }

    fn destroy_sets(&self, id: ClientId, family: Family, cleanup: &mut CleanupLog) {
        for role in SetRole::ALL {
            self.sets.destroy(&allocator::set_name(id, role, family), cleanup);
        }
    }
}
