//! Time-bounded cache of the server's model listing.

use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::client::InferenceBackend;
use crate::error::InferenceError;
use crate::wire::ModelInfo;

#[derive(Debug, Clone)]
struct Entry {
    models: Vec<ModelInfo>,
    fetched_at: Instant,
}

/// Model listing shared across runs, refreshed once it is older than the TTL.
///
/// The lock is never held across an await point. Two runs that find the
/// entry stale at the same moment may both refresh it; the later write wins.
#[derive(Debug)]
pub struct ModelCache {
    ttl: Duration,
    entry: RwLock<Option<Entry>>,
}

impl ModelCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: RwLock::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The cached listing, if it is still fresh.
    pub fn get(&self) -> Option<Vec<ModelInfo>> {
        let guard = self.entry.read();
        guard
            .as_ref()
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.models.clone())
    }

    pub fn store(&self, models: Vec<ModelInfo>) {
        *self.entry.write() = Some(Entry {
            models,
            fetched_at: Instant::now(),
        });
    }

    pub fn invalidate(&self) {
        *self.entry.write() = None;
    }

    /// Return the fresh listing, fetching it from `backend` when stale.
    ///
    /// A failed fetch leaves the previous entry untouched.
    pub async fn get_or_refresh(
        &self,
        backend: &dyn InferenceBackend,
    ) -> Result<Vec<ModelInfo>, InferenceError> {
        if let Some(models) = self.get() {
            debug!(count = models.len(), "model list served from cache");
            return Ok(models);
        }

        let models = backend.list_models().await?;
        debug!(count = models.len(), ttl_secs = self.ttl.as_secs(), "model list refreshed");
        self.store(models.clone());
        Ok(models)
    }
}
