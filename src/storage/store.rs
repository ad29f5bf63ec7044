//! The metadata store service.
//!
//! One writer connection and a small pool of reader connections over the
//! same WAL database. Writes are serialized on the writer; reads never wait
//! for them, and a long read only ties up one reader.

use rusqlite::Connection;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};

use crate::config::Config;
use crate::error::{MetaError, Result};
use crate::storage::connection;
use crate::storage::{MetaRecord, OldLocMode, Repository, LEGACY_DB_FILE_NAME};

const READER_POOL_SIZE: usize = 4;

pub struct MetaStore {
    db_path: PathBuf,
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
    _writer_lock: File,
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|_| MetaError::State("Poisoned lock".into()))
}

impl MetaStore {
    /// Open (or create) the store for a configured root, migrating a legacy
    /// in-tree database when a separate database directory is configured.
    pub fn open_for(config: &Config) -> Result<Self> {
        let db_path = config.db_path();
        if config.db_dir.is_some() {
            let legacy = config.root.join(LEGACY_DB_FILE_NAME);
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            connection::migrate_legacy(&legacy, &db_path)?;
        }
        Self::open(&db_path)
    }

    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let writer_lock = connection::acquire_writer_lock(db_path)?;

        let mut writer = connection::open_writer(db_path)?;
        Repository::new(&mut writer).initialize()?;
        let readers = (0..READER_POOL_SIZE)
            .map(|_| connection::open_reader(db_path).map(Mutex::new))
            .collect::<Result<Vec<_>>>()?;

        tracing::info!("[Store] Opened {}", db_path.display());
        Ok(Self {
            db_path: db_path.to_path_buf(),
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
            _writer_lock: writer_lock,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// First idle reader, starting from a rotating offset; waits on that
    /// offset's reader only when all of them are busy.
    fn reader(&self) -> Result<MutexGuard<'_, Connection>> {
        let start = self.next_reader.fetch_add(1, Ordering::Relaxed);
        for i in 0..self.readers.len() {
            match self.readers[(start + i) % self.readers.len()].try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::WouldBlock) => continue,
                Err(TryLockError::Poisoned(_)) => return Err(MetaError::State("Poisoned lock".into())),
            }
        }
        lock(&self.readers[start % self.readers.len()])
    }

    fn read<T>(&self, f: impl FnOnce(&Repository<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.reader()?;
        let repo = Repository::new(&mut conn);
        f(&repo)
    }

    fn write<T>(&self, f: impl FnOnce(&mut Repository<'_>) -> Result<T>) -> Result<T> {
        let mut conn = lock(&self.writer)?;
        let mut repo = Repository::new(&mut conn);
        f(&mut repo)
    }

    pub fn get(&self, path: &str) -> Result<Option<MetaRecord>> {
        self.read(|repo| repo.get(path))
    }

    /// Like `get`, but absence is an error.
    pub fn fetch(&self, path: &str) -> Result<MetaRecord> {
        self.get(path)?.ok_or_else(|| MetaError::NotFound(path.to_string()))
    }

    /// Upsert by path. Tags and icons are sorted before the write.
    pub fn set(&self, record: &MetaRecord) -> Result<()> {
        let mut record = record.clone();
        record.canonicalize();
        self.write(|repo| repo.upsert(&record))
    }

    pub fn update_stat(&self, path: &str, size: u64, mod_time: chrono::DateTime<chrono::Utc>) -> Result<bool> {
        self.write(|repo| repo.update_stat(path, size, mod_time))
    }

    /// Remove a record and, for a directory, everything beneath it.
    pub fn delete(&self, path: &str) -> Result<usize> {
        if path.is_empty() {
            return Err(MetaError::InvalidPath("refusing to delete the whole tree".into()));
        }
        let removed = self.write(|repo| repo.delete_tree(path))?;
        tracing::debug!("[Store] Deleted {} record(s) under {}", removed, path);
        Ok(removed)
    }

    pub fn delete_paths(&self, batch: &[String]) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        self.write(|repo| repo.delete_paths(batch))
    }

    pub fn list(&self, prefix: &str) -> Result<Vec<MetaRecord>> {
        self.read(|repo| repo.list(prefix))
    }

    /// Paths under `prefix` after `after`, at most `limit` of them. The
    /// reader is released between pages.
    pub fn page_paths(&self, prefix: &str, after: &str, limit: usize) -> Result<Vec<String>> {
        self.read(|repo| repo.page_paths(prefix, after, limit))
    }

    /// Sum of file sizes under `prefix`, straight from the table.
    pub fn sum_file_sizes(&self, prefix: &str) -> Result<u64> {
        self.read(|repo| repo.sum_file_sizes(prefix))
    }

    pub fn distinct_dirs(&self) -> Result<Vec<String>> {
        self.read(|repo| repo.distinct_dirs())
    }

    pub fn move_tree(&self, src: &str, dst: &str, mode: OldLocMode) -> Result<usize> {
        let moved = self.write(|repo| repo.move_tree(src, dst, mode))?;
        tracing::debug!("[Store] Moved {} record(s) {} -> {}", moved, src, dst);
        Ok(moved)
    }

    pub fn count(&self) -> Result<u64> {
        self.read(|repo| repo.count())
    }
}
