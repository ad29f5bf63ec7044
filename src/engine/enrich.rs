// FILE: src/engine/enrich.rs
//! Listing enrichment.
//!
//! Each entry gets one task on a bounded pool. A task resolves the entry's
//! canonical key against the lookup cache, going to the metadata service on
//! a miss. Entries with no structured match but a searchable name fall back
//! to a cached title, or queue a title search for a later request.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::{naming, paths};
use crate::engine::indexer::Indexer;
use crate::engine::lookup::{Lookup, MetadataSource, MovieMeta, TitleSearch};
use crate::engine::pool::{BackgroundQueue, TaskOutcome, WorkerPool};
use crate::error::{MetaError, Result};
use crate::state::Caches;
use crate::storage::{MetaStore, CONTEXT_TITLE};

const LIKED: &str = "♥️";
const SCORE_FIVE: &str = "🔥";
const SCORE_FOUR: &str = "👍";
const UNCONFIRMED: &str = "❗";

/// Descriptive fields resolved for one listing entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enrichment {
    pub description: String,
    pub thumbnail: String,
    pub tags: Vec<String>,
}

/// One entry handed to the pipeline. `index` is the caller's position for it.
#[derive(Debug, Clone)]
pub struct EnrichTarget {
    pub index: usize,
    pub name: String,
    pub path: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EnrichReport {
    pub enriched: usize,
    pub timed_out: usize,
    pub failed: usize,
    pub cancelled: usize,
}

fn series_of(key: &str) -> &str {
    key.split('-').next().unwrap_or(key)
}

pub struct Enricher {
    store: Arc<MetaStore>,
    indexer: Arc<Indexer>,
    caches: Arc<Caches>,
    source: Arc<dyn MetadataSource>,
    search: Arc<dyn TitleSearch>,
    pool: WorkerPool,
    titles: BackgroundQueue,
    lookup_positive_ttl: Duration,
    lookup_negative_ttl: Duration,
    search_positive_ttl: Duration,
    search_negative_ttl: Duration,
    title_ttl: Duration,
    local_store_from: String,
    local_store_to: String,
}

impl Enricher {
    /// Must be called inside a tokio runtime; starts the title workers.
    pub fn new(
        config: &Config,
        store: Arc<MetaStore>,
        indexer: Arc<Indexer>,
        caches: Arc<Caches>,
        source: Arc<dyn MetadataSource>,
        search: Arc<dyn TitleSearch>,
    ) -> Self {
        // A title search may walk several endpoints with retries.
        let title_deadline = config.http_timeout * (config.http_retries + 1) * 3 + config.http_retry_wait_max;
        Self {
            store,
            indexer,
            caches,
            source,
            search,
            pool: WorkerPool::new("enrich", config.enrich_workers, config.enrich_deadline),
            titles: BackgroundQueue::start("title", config.title_workers, config.queue_capacity, title_deadline),
            lookup_positive_ttl: config.lookup_positive_ttl,
            lookup_negative_ttl: config.lookup_negative_ttl,
            search_positive_ttl: config.search_positive_ttl,
            search_negative_ttl: config.search_negative_ttl,
            title_ttl: config.title_ttl,
            local_store_from: config.local_store_from.clone(),
            local_store_to: config.local_store_to.clone(),
        }
    }

    /// Enrich a batch. Returns the entries that got fields, keyed by their
    /// `index`, plus a tally. Never fails as a whole: a failed or slow entry
    /// is simply left out.
    pub async fn enrich(
        self: &Arc<Self>,
        targets: Vec<EnrichTarget>,
        local_store: bool,
        cancel: &CancellationToken,
    ) -> (Vec<(usize, Enrichment)>, EnrichReport) {
        let indices: Vec<usize> = targets.iter().map(|t| t.index).collect();
        let keys: Vec<String> = targets.iter().map(|t| t.path.clone()).collect();
        let enricher = Arc::clone(self);
        let outcomes = self
            .pool
            .run_batch(
                targets,
                move |target| {
                    let enricher = Arc::clone(&enricher);
                    async move { enricher.resolve(&target, local_store).await }
                },
                cancel,
            )
            .await;

        let mut report = EnrichReport::default();
        let mut results = Vec::new();
        for ((index, path), outcome) in indices.into_iter().zip(keys).zip(outcomes) {
            match outcome {
                TaskOutcome::Done(Some(found)) => {
                    report.enriched += 1;
                    results.push((index, found));
                }
                TaskOutcome::Done(None) => {}
                TaskOutcome::TimedOut => {
                    tracing::debug!("[Enricher] {} timed out after {:?}", path, self.pool.deadline());
                    report.timed_out += 1;
                }
                TaskOutcome::Failed(e) => {
                    tracing::warn!("[Enricher] {} failed: {}", path, e);
                    report.failed += 1;
                }
                TaskOutcome::Cancelled => report.cancelled += 1,
            }
        }
        (results, report)
    }

    /// Resolve one entry without the pool.
    pub async fn resolve(&self, target: &EnrichTarget, local_store: bool) -> Result<Option<Enrichment>> {
        let name = target.name.trim_end_matches('/');

        if let Some(key) = naming::canonical_key(name) {
            if let Lookup::Found(meta) = self.lookup(&key).await {
                return Ok(Some(self.populate(&key, &meta, local_store)));
            }
        }

        let Some(searchable) = naming::searchable_name(name) else {
            return Ok(None);
        };
        if let Some(title) = self.caches.titles.get(target.path.as_str()) {
            return Ok(Some(Enrichment { description: format!("{}{}", UNCONFIRMED, title), ..Enrichment::default() }));
        }
        self.queue_title_fetch(&target.path, searchable);
        Ok(None)
    }

    /// Cache-or-fetch a structured lookup. Service errors are cached as a
    /// miss with the short TTL.
    pub async fn lookup(&self, key: &str) -> Lookup {
        if let Some(hit) = self.caches.lookups.get(key) {
            return hit;
        }

        let fetched = match self.source.lookup(key).await {
            Ok(Some(meta)) => Lookup::Found(meta),
            Ok(None) => Lookup::Missing,
            Err(e) => {
                tracing::warn!("[Enricher] lookup {} failed: {}", key, e);
                Lookup::Missing
            }
        };
        let ttl = if fetched.is_found() { self.lookup_positive_ttl } else { self.lookup_negative_ttl };
        self.caches.lookups.insert_with_ttl(key.to_string(), fetched.clone(), ttl);
        fetched
    }

    fn populate(&self, key: &str, meta: &MovieMeta, local_store: bool) -> Enrichment {
        let mut description = String::new();
        if meta.liked {
            description.push_str(LIKED);
        }
        match meta.score {
            5 => description.push_str(SCORE_FIVE),
            4 => description.push_str(SCORE_FOUR),
            _ => {}
        }
        description.push_str(&meta.title);

        let thumbnail = if local_store && !self.local_store_from.is_empty() {
            meta.cover.replacen(&self.local_store_from, &self.local_store_to, 1)
        } else {
            meta.cover.clone()
        };

        let mut tags = meta.tags.clone();
        tags.push(series_of(key).to_string());
        tags.sort();
        tags.dedup();

        Enrichment { description, thumbnail, tags }
    }

    fn queue_title_fetch(&self, path: &str, searchable: String) {
        let store = Arc::clone(&self.store);
        let indexer = Arc::clone(&self.indexer);
        let caches = Arc::clone(&self.caches);
        let search = Arc::clone(&self.search);
        let ttls = TitleTtls {
            title: self.title_ttl,
            positive: self.search_positive_ttl,
            negative: self.search_negative_ttl,
        };
        let key = path.to_string();
        self.titles.submit(path, async move {
            if let Err(e) = fetch_title(&store, &indexer, &caches, search.as_ref(), &key, &searchable, ttls).await {
                tracing::debug!("[Enricher] title fetch for {} failed: {}", key, e);
            }
        });
    }
}

#[derive(Clone, Copy)]
struct TitleTtls {
    title: Duration,
    positive: Duration,
    negative: Duration,
}

/// Fill the title cache for `path` from the record's context, or from a
/// search that is then persisted into the context.
async fn fetch_title(
    store: &Arc<MetaStore>,
    indexer: &Arc<Indexer>,
    caches: &Caches,
    search: &dyn TitleSearch,
    path: &str,
    searchable: &str,
    ttls: TitleTtls,
) -> Result<()> {
    if caches.titles.contains(path) {
        return Ok(());
    }

    let mut record = match store.get(path)? {
        Some(record) => record,
        None => {
            let indexer = Arc::clone(indexer);
            let key = path.to_string();
            tokio::task::spawn_blocking(move || indexer.load_path(&key))
                .await
                .map_err(|e| MetaError::State(format!("load panicked: {}", e)))??
        }
    };

    if let Some(title) = record.context_str(CONTEXT_TITLE) {
        caches.titles.insert_with_ttl(path.to_string(), title.to_string(), ttls.title);
        return Ok(());
    }

    let title = match caches.searches.get(searchable) {
        Some(cached) => cached,
        None => {
            let found = search.search(searchable).await?;
            let ttl = if found.is_some() { ttls.positive } else { ttls.negative };
            caches.searches.insert_with_ttl(searchable.to_string(), found.clone(), ttl);
            found
        }
    };

    let Some(title) = title else {
        return Ok(());
    };
    tracing::info!("[Enricher] found title for {}: {}", paths::base_name(path), title);
    record.context.insert(CONTEXT_TITLE.to_string(), serde_json::Value::String(title.clone()));
    store.set(&record)?;
    caches.titles.insert_with_ttl(path.to_string(), title, ttls.title);
    Ok(())
}
