//! Domain rule resolution
//!
//! Domains are resolved fresh on every pass since CDN-backed names rotate
//! their addresses. A failed lookup yields no addresses so that one bad
//! rule never blocks the rest of a client's configuration.

use crate::platform::NameResolver;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedAddrs {
    pub v4: BTreeSet<Ipv4Addr>,
    pub v6: BTreeSet<Ipv6Addr>,
}

impl ResolvedAddrs {
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}

pub struct DomainResolver<'a> {
    resolver: &'a dyn NameResolver,
}

impl<'a> DomainResolver<'a> {
    pub fn new(resolver: &'a dyn NameResolver) -> Self {
        Self { resolver }
    }

    pub fn resolve(&self, domain: &str) -> ResolvedAddrs {
        let mut result = ResolvedAddrs::default();
        let addrs = match self.resolver.lookup(domain) {
            Ok(addrs) => addrs,
            Err(e) if e.is_absent() => {
                debug!("{} did not resolve", domain);
                return result;
            }
            Err(e) => {
                warn!("Failed to resolve {}: {}", domain, e);
                return result;
            }
        };

        for addr in addrs {
            match addr {
                IpAddr::V4(v4) => {
                    result.v4.insert(v4);
                }
                IpAddr::V6(v6) => {
                    result.v6.insert(v6);
                }
            }
        }
        debug!(
            "Resolved {} -> {} ipv4, {} ipv6",
            domain,
            result.v4.len(),
            result.v6.len()
        );
        result
    }
}
