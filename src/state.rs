//! Last-applied routing state
//!
//! The snapshot is the only record of which kernel objects a previous pass
//! created, so it is rewritten wholesale after every pass and read back at
//! the start of the next one to find what has to be torn down.

use crate::model::{ClientId, UpstreamId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to read state file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse state file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to write state file {path}: {source}")]
    WriteError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to serialize state: {0}")]
    SerializeError(#[from] serde_json::Error),
}

/// Resources applied for one client
///
/// Everything relay-related is `None` unless it was actually achieved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSnapshot {
    pub id: ClientId,
    pub mark: u32,
    pub table: u32,
    pub upstream_interface: Option<String>,
    pub upstream_config_path: Option<String>,
    pub ipv4_address: Option<String>,
    pub ipv6_address: Option<String>,
    pub chain4: Option<String>,
    pub chain6: Option<String>,
    pub proxy_set4: Option<String>,
    pub proxy_set6: Option<String>,
    pub direct_set4: Option<String>,
    pub direct_set6: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_upstream_id: Option<UpstreamId>,
}

impl ClientSnapshot {
    /// Snapshot of a client with no relay state at all
    pub fn absent(id: ClientId, mark: u32, table: u32) -> Self {
        Self {
            id,
            mark,
            table,
            upstream_interface: None,
            upstream_config_path: None,
            ipv4_address: None,
            ipv6_address: None,
            chain4: None,
            chain6: None,
            proxy_set4: None,
            proxy_set6: None,
            direct_set4: None,
            direct_set6: None,
            shared_upstream_id: None,
        }
    }

    pub fn has_relay_state(&self) -> bool {
        self.upstream_interface.is_some()
            || self.upstream_config_path.is_some()
            || self.chain4.is_some()
            || self.chain6.is_some()
            || self.proxy_set4.is_some()
            || self.proxy_set6.is_some()
            || self.direct_set4.is_some()
            || self.direct_set6.is_some()
    }

    /// Addresses the client's chain jumps may still be keyed on
    pub fn addresses(&self) -> Vec<&str> {
        [&self.ipv4_address, &self.ipv6_address]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect()
    }
}

/// A shared relay interface that is up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamSnapshot {
    pub id: UpstreamId,
    pub interface_name: String,
    pub config_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingState {
    pub clients: BTreeMap<ClientId, ClientSnapshot>,
    pub upstreams: BTreeMap<UpstreamId, UpstreamSnapshot>,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the last snapshot; a missing file means nothing was applied yet
    pub fn load(&self) -> Result<RoutingState, StateError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RoutingState::default());
            }
            Err(source) => {
                return Err(StateError::ReadError {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if content.trim().is_empty() {
            return Ok(RoutingState::default());
        }
        serde_json::from_str(&content).map_err(|source| StateError::ParseError {
            path: self.path.clone(),
            source,
        })
    }

    /// Replace the snapshot on disk
    pub fn save(&self, state: &RoutingState) -> Result<(), StateError> {
        let content = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("tmp");
        write_private(&tmp, &content)
            .and_then(|()| fs::rename(&tmp, &self.path))
            .map_err(|source| StateError::WriteError {
                path: self.path.clone(),
                source,
            })
    }
}

/// Write `content` to `path` readable by the owner only, creating parents
pub fn write_private(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    // mode() only applies on creation
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(content.as_bytes())?;
    file.sync_all()
}
