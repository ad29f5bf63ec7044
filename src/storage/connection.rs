//! Database connection management
//!
//! Opens the metadata database with write-ahead journaling, takes the
//! single-writer lock and moves a legacy in-tree database next to a newly
//! configured database directory.

use fs2::FileExt;
use rusqlite::{Connection, OpenFlags};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MetaError, Result};

// SQL pragma constants
const WAL: &str = "WAL";
const ON: &str = "ON";
const NORMAL: &str = "NORMAL";
const MEMORY: &str = "MEMORY";
const CACHE_PAGES: i64 = 10_000;
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const COMPANION_SUFFIXES: &[&str] = &["", "-wal", "-shm"];

fn companion(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

/// Lock file guarding write access to `db_path`.
pub fn lock_path(db_path: &Path) -> PathBuf {
    companion(db_path, ".lock")
}

/// Take the exclusive writer lock. Held for as long as the returned file lives.
pub fn acquire_writer_lock(db_path: &Path) -> Result<File> {
    let path = lock_path(db_path);
    let file = OpenOptions::new().create(true).write(true).truncate(false).open(&path)?;
    file.try_lock_exclusive().map_err(|e| {
        MetaError::Persistence(format!("{} is held by another writer: {}", path.display(), e))
    })?;
    Ok(file)
}

/// Copy a legacy database (and its journals) to `db_path` when the new
/// location is still empty. Returns whether anything was copied.
pub fn migrate_legacy(legacy: &Path, db_path: &Path) -> Result<bool> {
    if legacy == db_path || db_path.exists() || !legacy.exists() {
        return Ok(false);
    }

    for suffix in COMPANION_SUFFIXES {
        let src = companion(legacy, suffix);
        if !src.exists() {
            continue;
        }
        let dst = companion(db_path, suffix);
        std::fs::copy(&src, &dst)?;
        tracing::info!("[Store] Migrated {} -> {}", src.display(), dst.display());
    }
    Ok(true)
}

/// Open the read-write connection. Creates the database directory if needed.
pub fn open_writer(db_path: &Path) -> Result<Connection> {
    let db_dir = db_path
        .parent()
        .ok_or_else(|| MetaError::InvalidPath("Invalid database path".into()))?;
    std::fs::create_dir_all(db_dir).map_err(MetaError::Io)?;

    let conn = Connection::open(db_path).map_err(MetaError::Database)?;

    // Enable WAL mode so the reader connection is never blocked by a write
    conn.pragma_update(None, "journal_mode", WAL)?;
    conn.pragma_update(None, "synchronous", NORMAL)?;
    conn.pragma_update(None, "cache_size", CACHE_PAGES)?;
    conn.pragma_update(None, "temp_store", MEMORY)?;
    conn.pragma_update(None, "secure_delete", ON)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    Ok(conn)
}

/// Open a read-only connection. The writer must have created the file first.
pub fn open_reader(db_path: &Path) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI;
    let conn = Connection::open_with_flags(db_path, flags).map_err(MetaError::Database)?;
    conn.pragma_update(None, "cache_size", CACHE_PAGES)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_writer_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("kfs.db");

        let _held = acquire_writer_lock(&db).unwrap();
        let err = acquire_writer_lock(&db).unwrap_err();
        assert!(matches!(err, MetaError::Persistence(_)));
    }

    #[test]
    fn test_migrate_legacy_copies_companions() {
        let root = tempfile::tempdir().unwrap();
        let db_dir = tempfile::tempdir().unwrap();
        let legacy = root.path().join(".kfs.db");
        std::fs::write(&legacy, b"db").unwrap();
        std::fs::write(companion(&legacy, "-wal"), b"wal").unwrap();

        let target = db_dir.path().join("kfs.db");
        assert!(migrate_legacy(&legacy, &target).unwrap());
        assert_eq!(std::fs::read(&target).unwrap(), b"db");
        assert_eq!(std::fs::read(companion(&target, "-wal")).unwrap(), b"wal");
        assert!(!companion(&target, "-shm").exists());

        // Second run leaves the migrated copy alone
        assert!(!migrate_legacy(&legacy, &target).unwrap());
    }

    #[test]
    fn test_writer_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_writer(&dir.path().join("nested").join("kfs.db")).unwrap();
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |r| r.get(0)).unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
