//! Relay interface lifecycle
//!
//! A relay interface is defined entirely by the config file written here;
//! `wg-quick` is always given the file path so the interface name follows
//! the file name.

use super::CleanupLog;
use crate::platform::{LinkControl, PlatformError};
use crate::state::write_private;
use crate::wireguard::{render_interface_config, RelayTunnel};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("Failed to write relay config {path}: {source}")]
    WriteError { path: PathBuf, source: io::Error },
    #[error("Failed to bring up relay: {0}")]
    LinkError(#[from] PlatformError),
}

pub struct UpstreamInterfaces<'a> {
    links: &'a dyn LinkControl,
}

impl<'a> UpstreamInterfaces<'a> {
    pub fn new(links: &'a dyn LinkControl) -> Self {
        Self { links }
    }

    /// Write the relay config and (re)start its interface
    pub fn ensure(&self, relay: &RelayTunnel, config_path: &Path) -> Result<(), UpstreamError> {
        let content = render_interface_config(relay);
        write_private(config_path, &content).map_err(|source| UpstreamError::WriteError {
            path: config_path.to_path_buf(),
            source,
        })?;

        // not up yet on first provisioning
        if let Err(e) = self.links.down(config_path) {
            debug!("Relay {} was not up: {}", config_path.display(), e);
        }
        self.links.up(config_path)?;
        info!("Relay {} is up", config_path.display());
        Ok(())
    }

    pub fn teardown(&self, config_path: &Path, cleanup: &mut CleanupLog) {
        cleanup.record(
            format!("bring down {}", config_path.display()),
            self.links.down(config_path),
        );
        match fs::remove_file(config_path) {
            Ok(()) => debug!("Removed {}", config_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => cleanup.fail(format!("remove {}", config_path.display()), e),
        }
    }

    pub fn is_up(&self, interface: &str) -> Result<bool, PlatformError> {
        self.links.exists(interface)
    }
}
