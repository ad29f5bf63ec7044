// FILE: src/state.rs

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::config::Config;
use crate::core::paths;
use crate::core::TtlCache;
use crate::engine::aggregate::Sizer;
use crate::engine::enrich::Enricher;
use crate::engine::indexer::Indexer;
use crate::engine::lookup::{Disabled, HttpMetadataSource, HttpTitleSearch, Lookup, MetadataSource, TitleSearch};
use crate::error::Result;
use crate::storage::MetaStore;

/// Every cache the engine keeps, one typed instance per kind of entry.
pub struct Caches {
    /// Directory aggregate sizes by key.
    pub sizes: TtlCache<String, u64>,
    /// Structured lookups by canonical key, positive and negative.
    pub lookups: TtlCache<String, Lookup>,
    /// Free-text title searches by searchable name.
    pub searches: TtlCache<String, Option<String>>,
    /// Resolved fallback titles by record key.
    pub titles: TtlCache<String, String>,
    /// Serialized idempotent responses by request fingerprint.
    pub responses: TtlCache<String, Arc<Vec<u8>>>,
}

impl Caches {
    pub fn new(config: &Config) -> Self {
        let cap = config.cache_capacity;
        Self {
            sizes: TtlCache::new("sizes", cap, config.size_ttl),
            lookups: TtlCache::new("lookups", cap, config.lookup_negative_ttl),
            searches: TtlCache::new("searches", cap, config.search_negative_ttl),
            titles: TtlCache::new("titles", cap, config.title_ttl),
            responses: TtlCache::new("responses", cap, config.response_ttl),
        }
    }

    /// A change at `key` makes its own aggregate and every ancestor's stale.
    pub fn invalidate_size_chain(&self, key: &str) -> usize {
        paths::ancestry(key).iter().filter(|k| self.sizes.remove(k.as_str()).is_some()).count()
    }

    /// Drop aggregates for `prefix`, its ancestors and everything under it.
    pub fn invalidate_sizes_around(&self, prefix: &str) -> usize {
        let chain = self.invalidate_size_chain(prefix);
        chain + self.sizes.remove_where(|k| paths::is_under(prefix, k))
    }
}

/// Global shared state: the service objects built once at start-up.
pub struct GlobalState {
    pub config: Config,

    /// Tree root every key is relative to
    pub root: PathBuf,

    pub store: Arc<MetaStore>,
    pub caches: Arc<Caches>,
    pub indexer: Arc<Indexer>,
    pub sizer: Arc<Sizer>,
    pub enricher: Arc<Enricher>,

    /// Serializes every tree-mutating operation.
    pub op_lock: tokio::sync::Mutex<()>,

    /// Short link registry: 12-hex hash -> static route.
    pub shortcuts: DashMap<String, String>,

    /// When did this process start?
    pub start_time: SystemTime,
}

/// Shared state wrapper for easy cloning and sharing
pub type SharedState = Arc<GlobalState>;

impl GlobalState {
    /// Build with the HTTP-backed sources from `config` (or disabled ones when
    /// no endpoint is configured). Must run inside a tokio runtime.
    pub fn open(config: Config) -> Result<SharedState> {
        let source: Arc<dyn MetadataSource> = if config.meta_host.is_empty() {
            tracing::info!("[State] No metadata host configured, structured lookups disabled");
            Arc::new(Disabled)
        } else {
            Arc::new(HttpMetadataSource::new(&config)?)
        };
        let search: Arc<dyn TitleSearch> = if config.search_endpoints.is_empty() {
            Arc::new(Disabled)
        } else {
            Arc::new(HttpTitleSearch::new(&config)?)
        };
        Self::build(config, source, search)
    }

    pub fn build(config: Config, source: Arc<dyn MetadataSource>, search: Arc<dyn TitleSearch>) -> Result<SharedState> {
        let root = config.root.clone();
        let store = Arc::new(MetaStore::open_for(&config)?);
        let caches = Arc::new(Caches::new(&config));
        let indexer = Arc::new(Indexer::new(
            root.clone(),
            Arc::clone(&store),
            Arc::clone(&caches),
            config.settle_interval,
            config.max_passes,
        ));
        let sizer = Arc::new(Sizer::new(&config, Arc::clone(&store), Arc::clone(&indexer), Arc::clone(&caches)));
        let enricher = Arc::new(Enricher::new(
            &config,
            Arc::clone(&store),
            Arc::clone(&indexer),
            Arc::clone(&caches),
            source,
            search,
        ));

        Ok(Arc::new(Self {
            config,
            root,
            store,
            caches,
            indexer,
            sizer,
            enricher,
            op_lock: tokio::sync::Mutex::new(()),
            shortcuts: DashMap::new(),
            start_time: SystemTime::now(),
        }))
    }

    pub fn trash_key(&self) -> String {
        paths::normalize(&self.config.trash_dir)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalidate_size_chain() {
        let caches = Caches::new(&Config::default());
        for key in ["", "a", "a/b", "a/b/c", "x"] {
            caches.sizes.insert(key.to_string(), 1);
        }
        assert_eq!(caches.invalidate_size_chain("a/b"), 3);
        assert!(caches.sizes.contains("a/b/c"));
        assert!(caches.sizes.contains("x"));
        assert!(!caches.sizes.contains(""));
    }

    #[test]
    fn test_invalidate_sizes_around() {
        let caches = Caches::new(&Config::default());
        for key in ["", "a", "a/b", "a/b/c", "ab"] {
            caches.sizes.insert(key.to_string(), 1);
        }
        assert_eq!(caches.invalidate_sizes_around("a/b"), 4);
        assert!(caches.sizes.contains("ab"));
    }
}
