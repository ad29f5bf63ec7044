// FILE: src/librarian.rs
//! Background upkeep: the periodic maintenance pass and the filesystem
//! watcher. Neither ever takes the operation mutex.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::core::{paths, Bouncer};
use crate::error::{MetaError, Result};
use crate::state::SharedState;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub scanned: usize,
    pub changed: usize,
    pub orphans: usize,
    pub sizes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Changed,
    Removed,
}

pub struct Librarian {
    pub state: SharedState,
    cancel: CancellationToken,
    maintenance: Option<tokio::task::JoinHandle<()>>,
    watcher: Option<thread::JoinHandle<()>>,
}

impl Librarian {
    pub fn new(state: SharedState, cancel: CancellationToken) -> Self {
        Self { state, cancel, maintenance: None, watcher: None }
    }

    /// One full pass: index, sweep orphans, refresh every directory size.
    pub fn run_maintenance(state: &SharedState) -> Result<MaintenanceReport> {
        let whole_tree = vec![String::new()];
        let started = Instant::now();

        let stats = state.indexer.index(&whole_tree)?;
        let orphans = state.indexer.remove_orphan(&whole_tree)?;
        let sizes = state.indexer.cache_all_sizes(state.config.size_ttl)?;

        let report = MaintenanceReport { scanned: stats.scanned, changed: stats.changed(), orphans, sizes };
        tracing::info!("[Librarian] maintenance pass done in {:?}: {:?}", started.elapsed(), report);
        Ok(report)
    }

    /// Must be called inside a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        let every = state.config.maintenance_interval;
        self.maintenance = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let pass_state = Arc::clone(&state);
                match tokio::task::spawn_blocking(move || Self::run_maintenance(&pass_state)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::error!("[Librarian] maintenance pass failed: {}", e),
                    Err(e) => tracing::error!("[Librarian] maintenance pass panicked: {}", e),
                }
            }
            tracing::info!("[Librarian] maintenance loop stopped");
        }));

        if self.state.config.watch {
            let state = Arc::clone(&self.state);
            let cancel = self.cancel.clone();
            let runtime = tokio::runtime::Handle::current();
            self.watcher = Some(
                thread::Builder::new()
                    .name("kfs-watcher".into())
                    .spawn(move || {
                        let _guard = runtime.enter();
                        if let Err(e) = Self::watcher_loop(&state, &cancel) {
                            tracing::error!("[Librarian] watcher stopped: {}", e);
                        }
                    })?,
            );
        }
        Ok(())
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.maintenance.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.watcher.take() {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }

    fn watcher_loop(state: &SharedState, cancel: &CancellationToken) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let mut watcher = RecommendedWatcher::new(tx, notify::Config::default())
            .map_err(|e| MetaError::State(format!("watcher: {}", e)))?;
        watcher
            .watch(&state.root, RecursiveMode::Recursive)
            .map_err(|e| MetaError::State(format!("watch {}: {}", state.root.display(), e)))?;
        tracing::info!("[Librarian] watching {}", state.root.display());

        let debounce = state.config.watch_debounce;
        let mut queue: HashMap<PathBuf, Pending> = HashMap::new();
        let mut last_activity = Instant::now();

        while !cancel.is_cancelled() {
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(Ok(event)) => {
                    if Self::collect(&event, &mut queue) {
                        last_activity = Instant::now();
                    }
                }
                Ok(Err(e)) => tracing::warn!("[Librarian] watch error: {}", e),
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if !queue.is_empty() && last_activity.elapsed() >= debounce {
                        let events = std::mem::take(&mut queue);
                        Self::flush(state, events);
                    }
                }
            }
        }
        Ok(())
    }

    fn collect(event: &Event, queue: &mut HashMap<PathBuf, Pending>) -> bool {
        let kind = match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => Pending::Changed,
            EventKind::Remove(_) => Pending::Removed,
            _ => return false,
        };
        let mut queued = false;
        for path in &event.paths {
            let internal = path.file_name().map(|n| Bouncer::is_internal(&n.to_string_lossy())).unwrap_or(false);
            if !internal {
                queue.insert(path.clone(), kind);
                queued = true;
            }
        }
        queued
    }

    fn flush(state: &SharedState, events: HashMap<PathBuf, Pending>) {
        let mut sweep: Vec<String> = Vec::new();
        for (path, kind) in events {
            let Ok(key) = paths::to_key(&state.root, &path) else { continue };
            state.caches.invalidate_size_chain(&key);
            let parent = paths::parent(&key).to_string();
            match kind {
                Pending::Changed => {
                    state.indexer.spawn_dynamic(&parent);
                }
                Pending::Removed => {
                    if !sweep.contains(&parent) {
                        sweep.push(parent);
                    }
                }
            }
        }
        if sweep.is_empty() {
            return;
        }
        match state.indexer.remove_orphan(&sweep) {
            Ok(n) => tracing::debug!("[Librarian] swept {} record(s) under {:?}", n, sweep),
            Err(e) => tracing::warn!("[Librarian] orphan sweep failed: {}", e),
        }
    }
}
