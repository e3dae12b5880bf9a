//! Single-writer access to the reconciler
//!
//! Record mutations may trigger passes concurrently; the service queues
//! them behind one lock and runs each blocking pass on the blocking pool so
//! async callers are never stalled by external commands.

use crate::model::{RecordError, RecordSet};
use crate::routing::engine::{HealthReport, StatusReport};
use crate::routing::{Reconciler, SyncError, SyncReport};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Records(#[from] RecordError),
    #[error("Routing task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Clone)]
pub struct RoutingService {
    reconciler: Arc<Mutex<Reconciler>>,
}

impl RoutingService {
    pub fn new(reconciler: Reconciler) -> Self {
        Self {
            reconciler: Arc::new(Mutex::new(reconciler)),
        }
    }

    async fn run<T, F>(&self, pass: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&Reconciler) -> Result<T, ServiceError> + Send + 'static,
    {
        let guard = self.reconciler.clone().lock_owned().await;
        debug!("Acquired routing lock");
        tokio::task::spawn_blocking(move || pass(&*guard)).await?
    }

    pub async fn sync(&self, records: RecordSet) -> Result<SyncReport, ServiceError> {
        self.run(move |r| Ok(r.sync(&records)?)).await
    }

    /// Read the record file inside the lock so the pass sees its latest
    /// contents
    pub async fn sync_file(&self, path: PathBuf) -> Result<SyncReport, ServiceError> {
        self.run(move |r| {
            let records = RecordSet::load(&path)?;
            Ok(r.sync(&records)?)
        })
        .await
    }

    pub async fn health(&self, records: RecordSet) -> Result<HealthReport, ServiceError> {
        self.run(move |r| Ok(r.health(&records)?)).await
    }

    pub async fn status(&self) -> Result<StatusReport, ServiceError> {
        self.run(|r| Ok(r.status()?)).await
    }

    pub async fn teardown(&self) -> Result<Vec<String>, ServiceError> {
        self.run(|r| Ok(r.teardown_all()?)).await
    }
}
