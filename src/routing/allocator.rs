//! Deterministic kernel resource identifiers per client
//!
//! Every mark, table, priority and object name is a pure function of the
//! client id, so a pass can always recompute what a previous pass created.
//!
//! | Resource | Value | Range for ids `0..=MAX_CLIENT_ID` |
//! |----------|-------|-----------------------------------|
//! | fwmark | `0xC000 + id` | `0xC000..=0xFFFF` |
//! | routing table | `60000 + id` | `60000..=76383` |
//! | rule priority | `1000 + id` | `1000..=17383` (below main at 32766) |
//! | relay interface | `wg-up-<id>` | at most 11 bytes |

use crate::model::ClientId;
use crate::platform::Family;
use std::path::{Path, PathBuf};

pub const MARK_BASE: u32 = 0xC000;
pub const TABLE_BASE: u32 = 60000;
pub const PRIORITY_BASE: u32 = 1000;

/// Largest id whose resources stay inside the ranges above
pub const MAX_CLIENT_ID: ClientId = 0x3FFF;

const INTERFACE_PREFIX: &str = "wg-up-";
const CHAIN_PREFIX: &str = "RELAY-CL";
const SET_PREFIX: &str = "relay-client";

pub fn is_valid_id(id: ClientId) -> bool {
    id <= MAX_CLIENT_ID
}

pub fn mark(id: ClientId) -> u32 {
    MARK_BASE.wrapping_add(id)
}

pub fn table(id: ClientId) -> u32 {
    TABLE_BASE.wrapping_add(id)
}

pub fn priority(id: ClientId) -> u32 {
    PRIORITY_BASE.wrapping_add(id)
}

pub fn interface_name(id: ClientId) -> String {
    format!("{INTERFACE_PREFIX}{id}")
}

pub fn config_path(upstream_dir: &Path, id: ClientId) -> PathBuf {
    upstream_dir.join(format!("{}.conf", interface_name(id)))
}

/// Config path for a named relay interface
pub fn interface_config_path(upstream_dir: &Path, interface: &str) -> PathBuf {
    upstream_dir.join(format!("{interface}.conf"))
}

pub fn chain_name(id: ClientId, family: Family) -> String {
    match family {
        Family::V4 => format!("{CHAIN_PREFIX}-{id}"),
        Family::V6 => format!("{CHAIN_PREFIX}6-{id}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetRole {
    Proxy,
    Direct,
}

impl SetRole {
    pub const ALL: [SetRole; 2] = [SetRole::Proxy, SetRole::Direct];

    fn as_str(self) -> &'static str {
        match self {
            SetRole::Proxy => "proxy",
            SetRole::Direct => "direct",
        }
    }
}

pub fn set_name(id: ClientId, role: SetRole, family: Family) -> String {
    let suffix = match family {
        Family::V4 => '4',
        Family::V6 => '6',
    };
    format!("{SET_PREFIX}-{id}-{}{suffix}", role.as_str())
}
