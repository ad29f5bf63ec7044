// FILE: src/engine/aggregate.rs
//! Directory aggregate sizes.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::core::paths;
use crate::engine::indexer::Indexer;
use crate::engine::pool::BackgroundQueue;
use crate::error::{MetaError, Result};
use crate::state::Caches;
use crate::storage::MetaStore;

/// Result of a size query raced against a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeOutcome {
    Computed(u64),
    /// The deadline passed first; the value is still being computed.
    Pending,
}

pub struct Sizer {
    store: Arc<MetaStore>,
    indexer: Arc<Indexer>,
    caches: Arc<Caches>,
    reindex_wait: Duration,
    size_ttl: Duration,
    size_deadline: Duration,
    queue: BackgroundQueue,
}

impl Sizer {
    /// Must be called inside a tokio runtime; starts the size workers.
    pub fn new(config: &Config, store: Arc<MetaStore>, indexer: Arc<Indexer>, caches: Arc<Caches>) -> Self {
        Self {
            store,
            indexer,
            caches,
            reindex_wait: config.reindex_wait,
            size_ttl: config.size_ttl,
            size_deadline: config.size_deadline,
            queue: BackgroundQueue::start("size", config.size_workers, config.queue_capacity, config.size_deadline),
        }
    }

    async fn sum(&self, prefix: &str) -> Result<u64> {
        let store = Arc::clone(&self.store);
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || store.sum_file_sizes(&prefix))
            .await
            .map_err(|e| MetaError::State(format!("size query panicked: {}", e)))?
    }

    /// Sum of file sizes under `prefix`. A zero sum may mean "not indexed
    /// yet": a dynamic pass is started and the sum is queried once more after
    /// `reindex_wait`. The second answer may still be zero.
    pub async fn aggregate_size(&self, prefix: &str) -> Result<u64> {
        let prefix = paths::checked(prefix)?;
        let size = self.sum(&prefix).await?;
        if size > 0 {
            return Ok(size);
        }

        if self.indexer.spawn_dynamic(&prefix) {
            tracing::debug!("[Sizer] {:?} sums to zero, indexing in the background", prefix);
        }
        tokio::time::sleep(self.reindex_wait).await;
        self.sum(&prefix).await
    }

    pub async fn size_with_timeout(&self, prefix: &str, deadline: Duration) -> Result<SizeOutcome> {
        match tokio::time::timeout(deadline, self.aggregate_size(prefix)).await {
            Ok(res) => res.map(SizeOutcome::Computed),
            Err(_) => Ok(SizeOutcome::Pending),
        }
    }

    /// Cached aggregate for `key`, or `None` after queueing a background
    /// computation that will fill the cache.
    pub fn cached_or_schedule(self: &Arc<Self>, key: &str) -> Option<u64> {
        if let Some(size) = self.caches.sizes.get(key) {
            return Some(size);
        }

        let sizer = Arc::clone(self);
        let job_key = key.to_string();
        self.queue.submit(key, async move {
            match sizer.size_with_timeout(&job_key, sizer.size_deadline).await {
                Ok(SizeOutcome::Computed(size)) => {
                    sizer.caches.sizes.insert_with_ttl(job_key, size, sizer.size_ttl);
                }
                Ok(SizeOutcome::Pending) => {
                    tracing::debug!("[Sizer] {} still pending after {:?}", job_key, sizer.size_deadline);
                }
                Err(e) => tracing::warn!("[Sizer] size of {} failed: {}", job_key, e),
            }
        });
        None
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.queue.is_pending(key)
    }
}
