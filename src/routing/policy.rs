//! Policy routing for marked packets and egress masquerade

use super::allocator;
use super::CleanupLog;
use crate::model::ClientId;
use crate::platform::{
    Family, FilterRule, FilterTable, FwmarkRule, PacketFilter, PlatformError, PolicyRoutes,
};
use crate::wireguard::DEFAULT_ALLOWED_IPS;
use tracing::debug;

const POSTROUTING: &str = "POSTROUTING";

pub fn fwmark_rule(id: ClientId) -> FwmarkRule {
    FwmarkRule {
        mark: allocator::mark(id),
        table: allocator::table(id),
        priority: allocator::priority(id),
    }
}

pub struct PolicyRouting<'a> {
    routes: &'a dyn PolicyRoutes,
    filter: &'a dyn PacketFilter,
}

impl<'a> PolicyRouting<'a> {
    pub fn new(routes: &'a dyn PolicyRoutes, filter: &'a dyn PacketFilter) -> Self {
        Self { routes, filter }
    }

    /// Route packets marked for `id` through `interface`
    ///
    /// Each family gets its fwmark rule re-added and its table rebuilt from
    /// `allowed_ips` (everything when the list is empty).
    pub fn ensure(
        &self,
        id: ClientId,
        interface: &str,
        allowed_ips: &[String],
        cleanup: &mut CleanupLog,
    ) -> Result<(), PlatformError> {
        let rule = fwmark_rule(id);
        let networks: Vec<&str> = if allowed_ips.is_empty() {
            DEFAULT_ALLOWED_IPS.to_vec()
        } else {
            allowed_ips.iter().map(String::as_str).collect()
        };

        for family in Family::ALL {
            self.remove_family(family, &rule, cleanup);
            self.routes.add_rule(family, &rule)?;
            for network in networks.iter().filter(|n| Family::of_network(n) == family) {
                self.routes
                    .replace_route(family, rule.table, network, interface)?;
            }
        }
        debug!(
            "Client {}: fwmark {:#x} -> table {} via {}",
            id, rule.mark, rule.table, interface
        );
        Ok(())
    }

    pub fn teardown(&self, id: ClientId, cleanup: &mut CleanupLog) {
        let rule = fwmark_rule(id);
        for family in Family::ALL {
            self.remove_family(family, &rule, cleanup);
        }
    }

    fn remove_family(&self, family: Family, rule: &FwmarkRule, cleanup: &mut CleanupLog) {
        cleanup.record(
            format!("delete {family} fwmark rule {:#x}", rule.mark),
            self.routes.delete_rule(family, rule),
        );
        cleanup.record(
            format!("flush {family} table {}", rule.table),
            self.routes.flush_table(family, rule.table),
        );
    }

    /// Masquerade traffic leaving through `interface` (IPv4 only)
    pub fn masquerade(&self, interface: &str, cleanup: &mut CleanupLog) -> Result<(), PlatformError> {
        let rule = masquerade_rule(interface);
        self.unmasquerade(interface, cleanup);
        self.filter
            .append(Family::V4, FilterTable::Nat, POSTROUTING, &rule)
    }

    pub fn unmasquerade(&self, interface: &str, cleanup: &mut CleanupLog) {
        cleanup.record(
            format!("remove masquerade on {interface}"),
            self.filter.delete(
                Family::V4,
                FilterTable::Nat,
                POSTROUTING,
                &masquerade_rule(interface),
            ),
        );
    }
}

fn masquerade_rule(interface: &str) -> FilterRule {
    FilterRule::Masquerade {
        out_interface: interface.to_string(),
    }
}
