//! Per-client relay routing and split tunneling
//!
//! The engine turns client/upstream/rule records into kernel state:
//!
//! - `allocator`: deterministic marks, tables, priorities and object names
//! - `upstream`: relay interface configs and `wg-quick` lifecycle
//! - `policy`: fwmark rules, per-client routing tables, masquerade
//! - `chain`: mangle chains that mark a client's packets
//! - `ipset`: proxy/direct target sets matched by those chains
//! - `resolver` and `targets`: turning split rules into set members
//! - `engine`: the reconciliation pass tying it all together

pub mod allocator;
pub mod chain;
pub mod engine;
pub mod ipset;
pub mod policy;
pub mod resolver;
pub mod targets;
pub mod upstream;

pub use engine::{ClientOutcome, ClientStage, Reconciler, SyncError, SyncReport};
pub use targets::DomainTarget;

use crate::platform::PlatformError;
use std::fmt::Display;
use tracing::{debug, warn};

/// How a best-effort removal ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleanup {
    Removed,
    AlreadyAbsent,
    Failed,
}

/// Collects removals that failed for reasons other than "not there"
#[derive(Debug, Default)]
pub struct CleanupLog {
    failures: Vec<String>,
}

impl CleanupLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, action: impl Display, result: Result<(), PlatformError>) -> Cleanup {
        match result {
            Ok(()) => Cleanup::Removed,
            Err(e) if e.is_absent() => {
                debug!("{}: already absent", action);
                Cleanup::AlreadyAbsent
            }
            Err(e) => {
                self.fail(action, e);
                Cleanup::Failed
            }
        }
    }

    /// Record a removal that failed outside the command layer
    pub fn fail(&mut self, action: impl Display, error: impl Display) {
        warn!("{} failed: {}", action, error);
        self.failures.push(format!("{action}: {error}"));
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    pub fn into_failures(self) -> Vec<String> {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_classification() {
        let mut log = CleanupLog::new();
        assert_eq!(log.record("remove a", Ok(())), Cleanup::Removed);
        assert_eq!(
            log.record("remove b", Err(PlatformError::Absent("b".into()))),
            Cleanup::AlreadyAbsent
        );
        assert!(log.failures().is_empty());

        let failed = log.record(
            "remove c",
            Err(PlatformError::CommandFailed {
                command: "ipset destroy c".into(),
                stderr: "in use".into(),
            }),
        );
        assert_eq!(failed, Cleanup::Failed);
        assert_eq!(log.failures().len(), 1);
        assert!(log.failures()[0].starts_with("remove c"));
    }
}
