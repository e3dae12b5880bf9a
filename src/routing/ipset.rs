//! Kernel IP set synchronization

use super::CleanupLog;
use crate::platform::{Family, IpSets, PlatformError};
use tracing::debug;

pub struct IpSetSync<'a> {
    sets: &'a dyn IpSets,
}

impl<'a> IpSetSync<'a> {
    pub fn new(sets: &'a dyn IpSets) -> Self {
        Self { sets }
    }

    /// Make `name` contain exactly `entries`
    ///
    /// Creating and flushing the set must succeed; individual entries that
    /// are rejected (duplicates, malformed) are skipped.
    pub fn sync<'e>(
        &self,
        name: &str,
        family: Family,
        entries: impl IntoIterator<Item = &'e String>,
    ) -> Result<usize, PlatformError> {
        self.sets.create(name, family)?;
        self.sets.flush(name)?;

        let mut added = 0;
        for entry in entries {
            match self.sets.add(name, entry) {
                Ok(()) => added += 1,
                Err(e) => debug!("Skipping {} in {}: {}", entry, name, e),
            }
        }
        debug!("Synced ipset {} ({} entries)", name, added);
        Ok(added)
    }

    pub fn destroy(&self, name: &str, cleanup: &mut CleanupLog) {
        cleanup.record(format!("destroy ipset {name}"), self.sets.destroy(name));
    }
}
