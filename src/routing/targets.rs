//! Split-tunnel target collection
//!
//! Gathers a client's proxy and direct rules (embedded lists first, then
//! enabled rule rows) and turns them into the CIDR entries of its four
//! target sets.

use super::allocator::{self, SetRole};
use super::resolver::DomainResolver;
use crate::model::{Client, ClientId, RuleAction, RuleTarget, RuleType, SplitRule};
use crate::platform::Family;
use ipnet::IpNet;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// A domain rule and the target sets its addresses land in
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainTarget {
    pub client_id: ClientId,
    pub domain: String,
    pub action: RuleAction,
    pub set4: String,
    pub set6: String,
}

/// CIDR members of a client's proxy/direct sets, per family
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSets {
    pub proxy4: BTreeSet<String>,
    pub proxy6: BTreeSet<String>,
    pub direct4: BTreeSet<String>,
    pub direct6: BTreeSet<String>,
}

impl TargetSets {
    pub fn get(&self, role: SetRole, family: Family) -> &BTreeSet<String> {
        match (role, family) {
            (SetRole::Proxy, Family::V4) => &self.proxy4,
            (SetRole::Proxy, Family::V6) => &self.proxy6,
            (SetRole::Direct, Family::V4) => &self.direct4,
            (SetRole::Direct, Family::V6) => &self.direct6,
        }
    }

    fn get_mut(&mut self, role: SetRole, family: Family) -> &mut BTreeSet<String> {
        match (role, family) {
            (SetRole::Proxy, Family::V4) => &mut self.proxy4,
            (SetRole::Proxy, Family::V6) => &mut self.proxy6,
            (SetRole::Direct, Family::V4) => &mut self.direct4,
            (SetRole::Direct, Family::V6) => &mut self.direct6,
        }
    }

    pub fn insert(&mut self, role: SetRole, net: IpNet) {
        let family = match net {
            IpNet::V4(_) => Family::V4,
            IpNet::V6(_) => Family::V6,
        };
        self.get_mut(role, family).insert(net.to_string());
    }

    /// No target of either role in `family`
    pub fn is_empty(&self, family: Family) -> bool {
        SetRole::ALL.iter().all(|role| self.get(*role, family).is_empty())
    }
}

/// One classified rule with the role it plays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleTarget {
    pub role: SetRole,
    pub target: RuleTarget,
}

fn role_of(action: RuleAction) -> SetRole {
    match action {
        RuleAction::Proxy => SetRole::Proxy,
        RuleAction::Direct => SetRole::Direct,
    }
}

fn action_of(role: SetRole) -> RuleAction {
    match role {
        SetRole::Proxy => RuleAction::Proxy,
        SetRole::Direct => RuleAction::Direct,
    }
}

/// Every valid rule for `client`, embedded lists before rule rows
///
/// Malformed entries and rows whose value does not match their declared
/// type are logged and left out.
pub fn collect_rules<'a>(
    client: &Client,
    rows: impl IntoIterator<Item = &'a SplitRule>,
) -> Vec<RoleTarget> {
    let split = client.split_tunnel();
    let embedded = split
        .proxy_rules
        .iter()
        .map(|r| (SetRole::Proxy, r.as_str(), None))
        .chain(
            split
                .direct_rules
                .iter()
                .map(|r| (SetRole::Direct, r.as_str(), None)),
        );
    let rows = rows
        .into_iter()
        .map(|r| (role_of(r.action), r.rule_value.as_str(), Some(r.rule_type)));

    let mut rules = Vec::new();
    for (role, value, declared) in embedded.chain(rows) {
        let target = RuleTarget::classify(value);
        let accepted = match (&target, declared) {
            (RuleTarget::Invalid(_), _) => false,
            (RuleTarget::Network(_), Some(RuleType::Domain)) => false,
            (RuleTarget::Domain(_), Some(RuleType::Ip)) => false,
            _ => true,
        };
        if !accepted {
            warn!("Client {}: skipping malformed rule {:?}", client.id, value);
            continue;
        }
        let entry = RoleTarget { role, target };
        if !rules.contains(&entry) {
            rules.push(entry);
        }
    }
    rules
}

/// Build the target sets, resolving domains afresh
pub fn resolve_targets(rules: &[RoleTarget], resolver: &DomainResolver<'_>) -> TargetSets {
    let mut sets = TargetSets::default();
    for rule in rules {
        match &rule.target {
            RuleTarget::Network(net) => sets.insert(rule.role, *net),
            RuleTarget::Domain(domain) => {
                let resolved = resolver.resolve(domain);
                if resolved.is_empty() {
                    debug!("{} has no addresses yet, left out of {:?} sets", domain, rule.role);
                }
                for addr in resolved.v4 {
                    sets.insert(rule.role, IpNet::from(std::net::IpAddr::V4(addr)));
                }
                for addr in resolved.v6 {
                    sets.insert(rule.role, IpNet::from(std::net::IpAddr::V6(addr)));
                }
            }
            RuleTarget::Invalid(_) => {}
        }
    }
    sets
}

/// Domain rules of a client and the sets they map to
pub fn domain_targets(client: ClientId, rules: &[RoleTarget]) -> Vec<DomainTarget> {
    rules
        .iter()
        .filter_map(|rule| match &rule.target {
            RuleTarget::Domain(domain) => Some(DomainTarget {
                client_id: client,
                domain: domain.clone(),
                action: action_of(rule.role),
                set4: allocator::set_name(client, rule.role, Family::V4),
                set6: allocator::set_name(client, rule.role, Family::V6),
            }),
            _ => None,
        })
        .collect()
}
