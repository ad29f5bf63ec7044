// FILE: src/engine/indexer.rs
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fs::Metadata;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::core::{paths, Bouncer};
use crate::error::{MetaError, Result};
use crate::state::Caches;
use crate::storage::{MetaRecord, MetaStore};

const ORPHAN_BATCH_SIZE: usize = 1000;

/// What a single observation did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Created,
    Unchanged,
    Updated(Change),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Size,
    ModTime,
    Both,
}

impl Change {
    fn label(self) -> &'static str {
        match self {
            Change::Size => "size",
            Change::ModTime => "modtime",
            Change::Both => "size+modtime",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub scanned: usize,
    pub created: usize,
    pub updated: usize,
    pub errors: usize,
}

impl PassStats {
    pub fn changed(&self) -> usize {
        self.created + self.updated
    }

    fn absorb(&mut self, other: PassStats) {
        self.scanned += other.scanned;
        self.created += other.created;
        self.updated += other.updated;
        self.errors += other.errors;
    }
}

/// States of a dynamic indexing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    Scanning,
    Settling,
    Converged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergenceReport {
    pub passes: u32,
    pub changes: usize,
    /// False when the pass cap was hit while the tree was still changing.
    pub converged: bool,
}

fn mod_time_of(meta: &Metadata) -> DateTime<Utc> {
    meta.modified().map(DateTime::<Utc>::from).unwrap_or_default()
}

pub struct Indexer {
    root: PathBuf,
    store: Arc<MetaStore>,
    caches: Arc<Caches>,
    settle: Duration,
    max_passes: u32,
    dynamic_runs: DashMap<String, ()>,
}

impl Indexer {
    pub fn new(root: PathBuf, store: Arc<MetaStore>, caches: Arc<Caches>, settle: Duration, max_passes: u32) -> Self {
        Self { root, store, caches, settle, max_passes: max_passes.max(1), dynamic_runs: DashMap::new() }
    }

    /// Reconcile one filesystem entry with its record.
    pub fn observe(&self, key: &str, meta: &Metadata) -> Result<Observation> {
        let size = meta.len();
        let mod_time = mod_time_of(meta);

        let Some(existing) = self.store.get(key)? else {
            self.store.set(&MetaRecord::observed(key, meta.is_dir(), size, mod_time))?;
            self.caches.invalidate_size_chain(key);
            return Ok(Observation::Created);
        };

        let change = match (existing.size != size, existing.mod_time != mod_time) {
            (false, false) => return Ok(Observation::Unchanged),
            (true, false) => Change::Size,
            (false, true) => Change::ModTime,
            (true, true) => Change::Both,
        };

        match change {
            Change::ModTime => tracing::info!("[Indexer] update {} modtime {} -> {}", key, existing.mod_time, mod_time),
            _ => tracing::info!(
                "[Indexer] update {} {} {} -> {}",
                key,
                change.label(),
                existing.size,
                size
            ),
        }

        self.store.update_stat(key, size, mod_time)?;
        self.caches.invalidate_size_chain(key);
        Ok(Observation::Updated(change))
    }

    /// Stat `key`, create or refresh its record and return it. Also schedules
    /// a dynamic pass on `key` when called inside a runtime.
    pub fn load_path(self: &Arc<Self>, key: &str) -> Result<MetaRecord> {
        let abs = paths::to_abs(&self.root, key);
        let meta = std::fs::symlink_metadata(&abs).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MetaError::NotFound(key.to_string())
            } else {
                MetaError::Io(e)
            }
        })?;
        self.observe(key, &meta)?;
        if meta.is_dir() {
            self.spawn_dynamic(key);
        }
        self.store.fetch(key)
    }

    fn index_prefix(&self, prefix: &str) -> Result<PassStats> {
        let mut stats = PassStats::default();
        let start = paths::to_abs(&self.root, prefix);
        if !start.exists() {
            tracing::debug!("[Indexer] {} does not exist, nothing to index", start.display());
            return Ok(stats);
        }

        let walker = walkdir::WalkDir::new(&start)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !Bouncer::is_internal(&e.file_name().to_string_lossy()));

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::debug!("[Indexer] walk error under {}: {}", prefix, e);
                    stats.errors += 1;
                    continue;
                }
            };
            let key = paths::to_key(&self.root, entry.path())?;
            if key.is_empty() {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!("[Indexer] stat failed for {}: {}", key, e);
                    stats.errors += 1;
                    continue;
                }
            };

            stats.scanned += 1;
            match self.observe(&key, &meta)? {
                Observation::Created => stats.created += 1,
                Observation::Updated(_) => stats.updated += 1,
                Observation::Unchanged => {}
            }
        }
        Ok(stats)
    }

    /// One reconciliation pass over every prefix.
    pub fn index(&self, prefixes: &[String]) -> Result<PassStats> {
        let mut total = PassStats::default();
        for prefix in prefixes {
            let prefix = paths::checked(prefix)?;
            total.absorb(self.index_prefix(&prefix)?);
        }
        if total.changed() > 0 {
            tracing::info!(
                "[Indexer] pass over {:?}: {} scanned, {} created, {} updated",
                prefixes,
                total.scanned,
                total.created,
                total.updated
            );
        }
        Ok(total)
    }

    /// Repeat `index` until a pass finds nothing to change, sleeping the
    /// settle interval between passes. Stops after `max_passes` regardless.
    pub async fn index_dynamically(self: &Arc<Self>, prefixes: Vec<String>) -> Result<ConvergenceReport> {
        let mut state = Convergence::Scanning;
        let mut report = ConvergenceReport { passes: 0, changes: 0, converged: false };

        loop {
            state = match state {
                Convergence::Scanning => {
                    report.passes += 1;
                    let indexer = Arc::clone(self);
                    let batch = prefixes.clone();
                    let stats = tokio::task::spawn_blocking(move || indexer.index(&batch))
                        .await
                        .map_err(|e| MetaError::State(format!("index pass panicked: {}", e)))??;

                    if stats.changed() == 0 {
                        Convergence::Converged
                    } else if report.passes >= self.max_passes {
                        tracing::warn!(
                            "[Indexer] {:?} still changing after {} passes, giving up for now",
                            prefixes,
                            report.passes
                        );
                        report.changes += stats.changed();
                        return Ok(report);
                    } else {
                        report.changes += stats.changed();
                        for prefix in &prefixes {
                            self.caches.invalidate_size_chain(&paths::normalize(prefix));
                        }
                        Convergence::Settling
                    }
                }
                Convergence::Settling => {
                    tracing::debug!("[Indexer] {:?} is changing, settling for {:?}", prefixes, self.settle);
                    tokio::time::sleep(self.settle).await;
                    Convergence::Scanning
                }
                Convergence::Converged => {
                    report.converged = true;
                    return Ok(report);
                }
            };
        }
    }

    /// Start a background dynamic run for `prefix` unless one is in flight.
    pub fn spawn_dynamic(self: &Arc<Self>, prefix: &str) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let prefix = paths::normalize(prefix);
        if self.dynamic_runs.insert(prefix.clone(), ()).is_some() {
            return false;
        }
        let indexer = Arc::clone(self);
        runtime.spawn(async move {
            match indexer.index_dynamically(vec![prefix.clone()]).await {
                Ok(report) => tracing::debug!("[Indexer] dynamic run on {:?} finished: {:?}", prefix, report),
                Err(e) => tracing::warn!("[Indexer] dynamic run on {:?} failed: {}", prefix, e),
            }
            indexer.dynamic_runs.remove(&prefix);
        });
        true
    }

    /// Delete records under each prefix whose path no longer exists.
    pub fn remove_orphan(&self, prefixes: &[String]) -> Result<usize> {
        let mut removed = 0;
        for prefix in prefixes {
            let prefix = paths::checked(prefix)?;
            let mut after = String::new();
            loop {
                // Stat outside the reader so foreground reads are not held up
                let page = self.store.page_paths(&prefix, &after, ORPHAN_BATCH_SIZE)?;
                let Some(last) = page.last() else { break };
                after = last.clone();

                let orphans: Vec<String> = page
                    .into_iter()
                    .filter(|key| std::fs::symlink_metadata(paths::to_abs(&self.root, key)).is_err())
                    .collect();
                removed += self.store.delete_paths(&orphans)?;
                for key in &orphans {
                    self.caches.invalidate_size_chain(key);
                }
            }
        }
        if removed > 0 {
            tracing::info!("[Indexer] removed {} orphan record(s) under {:?}", removed, prefixes);
        }
        Ok(removed)
    }

    /// Compute and cache the aggregate of every directory in the store.
    pub fn cache_all_sizes(&self, ttl: Duration) -> Result<usize> {
        let dirs = self.store.distinct_dirs()?;
        for dir in &dirs {
            let size = self.store.sum_file_sizes(dir)?;
            self.caches.sizes.insert_with_ttl(dir.clone(), size, ttl);
        }
        tracing::info!("[Indexer] cached {} directory size(s)", dirs.len());
        Ok(dirs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use crate::config::Config;

    fn fixture() -> (tempfile::TempDir, tempfile::TempDir, Arc<Indexer>, Arc<MetaStore>, Arc<Caches>) {
        let root = tempfile::tempdir().unwrap();
        let db = tempfile::tempdir().unwrap();
        let store = Arc::new(MetaStore::open(&db.path().join("kfs.db")).unwrap());
        let caches = Arc::new(Caches::new(&Config::default()));
        let indexer = Arc::new(Indexer::new(
            root.path().to_path_buf(),
            Arc::clone(&store),
            Arc::clone(&caches),
            Duration::from_millis(20),
            8,
        ));
        (root, db, indexer, store, caches)
    }

    fn write(root: &Path, rel: &str, bytes: usize) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, vec![0u8; bytes]).unwrap();
    }

    #[test]
    fn test_second_pass_is_a_no_op() {
        let (root, _db, indexer, store, _) = fixture();
        write(root.path(), "a/f1", 100);
        write(root.path(), "a/b/f2", 200);

        let first = indexer.index(&["".to_string()]).unwrap();
        assert_eq!(first.created, 4);
        let second = indexer.index(&["".to_string()]).unwrap();
        assert_eq!(second.changed(), 0);
        assert_eq!(second.scanned, 4);

        let dir = store.fetch("a/b").unwrap();
        assert!(dir.is_dir());
        assert_eq!(store.fetch("a/b/f2").unwrap().dir, "a/b");
    }

    #[test]
    fn test_size_change_is_detected_and_invalidates() {
        let (root, _db, indexer, store, caches) = fixture();
        write(root.path(), "a/f1", 100);
        indexer.index(&["a".to_string()]).unwrap();
        caches.sizes.insert("a".to_string(), 100);

        write(root.path(), "a/f1", 150);
        let meta = std::fs::metadata(root.path().join("a/f1")).unwrap();
        let obs = indexer.observe("a/f1", &meta).unwrap();
        assert!(matches!(obs, Observation::Updated(Change::Size) | Observation::Updated(Change::Both)));
        assert_eq!(store.fetch("a/f1").unwrap().size, 150);
        assert!(!caches.sizes.contains("a"));
    }

    #[test]
    fn test_internal_files_are_skipped() {
        let (root, _db, indexer, store, _) = fixture();
        write(root.path(), ".kfs.db", 10);
        write(root.path(), "d/.KFS_META", 10);
        write(root.path(), "d/real", 10);
        indexer.index(&["".to_string()]).unwrap();
        assert!(store.get(".kfs.db").unwrap().is_none());
        assert!(store.get("d/.KFS_META").unwrap().is_none());
        assert!(store.get("d/real").unwrap().is_some());
    }

    #[test]
    fn test_remove_orphan() {
        let (root, _db, indexer, store, _) = fixture();
        write(root.path(), "a/keep", 1);
        write(root.path(), "a/gone", 1);
        indexer.index(&["".to_string()]).unwrap();

        std::fs::remove_file(root.path().join("a/gone")).unwrap();
        assert_eq!(indexer.remove_orphan(&["a".to_string()]).unwrap(), 1);
        assert!(store.get("a/gone").unwrap().is_none());
        assert!(store.get("a/keep").unwrap().is_some());
    }

    #[test]
    fn test_remove_orphan_spans_pages() {
        let (root, _db, indexer, store, _) = fixture();
        write(root.path(), "big/kept", 1);
        let now = Utc::now();
        for i in 0..(ORPHAN_BATCH_SIZE * 2 + 5) {
            store.set(&MetaRecord::observed(&format!("big/ghost-{:05}", i), false, 1, now)).unwrap();
        }
        indexer.index(&["big".to_string()]).unwrap();

        let removed = indexer.remove_orphan(&["big".to_string()]).unwrap();
        assert_eq!(removed, ORPHAN_BATCH_SIZE * 2 + 5);
        assert_eq!(store.page_paths("big", "", 10).unwrap(), vec!["big", "big/kept"]);
    }

    #[test]
    fn test_cache_all_sizes() {
        let (root, _db, indexer, _, caches) = fixture();
        write(root.path(), "a/f1", 100);
        write(root.path(), "a/b/f2", 200);
        indexer.index(&["".to_string()]).unwrap();

        indexer.cache_all_sizes(Duration::from_secs(60)).unwrap();
        assert_eq!(caches.sizes.get("a"), Some(300));
        assert_eq!(caches.sizes.get("a/b"), Some(200));
    }

    #[test]
    fn test_load_path_missing() {
        let (_root, _db, indexer, _, _) = fixture();
        assert!(indexer.load_path("nope").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_dynamic_converges() {
        let (root, _db, indexer, _, _) = fixture();
        write(root.path(), "a/f1", 100);

        let report = indexer.index_dynamically(vec!["a".to_string()]).await.unwrap();
        assert!(report.converged);
        assert_eq!(report.passes, 2);
        assert_eq!(report.changes, 2);

        let again = indexer.index_dynamically(vec!["a".to_string()]).await.unwrap();
        assert_eq!(again.passes, 1);
        assert_eq!(again.changes, 0);
    }

    #[tokio::test]
    async fn test_dynamic_gives_up_at_cap() {
        let (root, _db, indexer, _, _) = fixture();
        let writer_root = root.path().to_path_buf();
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let churn = std::thread::spawn(move || {
            let mut n = 0usize;
            while !flag.load(std::sync::atomic::Ordering::SeqCst) {
                n += 1;
                write(&writer_root, "busy/copying", n);
                std::thread::sleep(Duration::from_millis(5));
            }
        });

        let report = indexer.index_dynamically(vec!["busy".to_string()]).await.unwrap();
        stop.store(true, std::sync::atomic::Ordering::SeqCst);
        churn.join().unwrap();

        assert!(!report.converged);
        assert_eq!(report.passes, 8);
    }
}
