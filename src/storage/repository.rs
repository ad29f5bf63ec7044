// FILE: src/storage/repository.rs
use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection, Row};
use serde_json::Value;

use crate::core::paths;
use crate::error::{MetaError, Result};
use crate::storage::MetaRecord;

const COLUMNS: &str = "path, dir, size, mod_time, label, tags, star, icons, old_loc, context";

// Segment-aware prefix match: ?1 is the prefix, ?2/?3 the length and value of "prefix/".
const UNDER_PREFIX: &str = "(?1 = '' OR path = ?1 OR substr(path, 1, ?2) = ?3)";

/// How `move_tree` treats the restore location of moved records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OldLocMode {
    /// Remember where each record came from (moving into the trash).
    Record,
    /// Forget it (restoring out of the trash).
    Clear,
}

pub struct Repository<'a> {
    conn: &'a mut Connection,
}

fn prefix_params(prefix: &str) -> (String, i64, String) {
    let with_slash = format!("{}/", prefix);
    let len = with_slash.chars().count() as i64;
    (prefix.to_string(), len, with_slash)
}

fn json_list(value: Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.into_iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
        _ => Vec::new(),
    }
}

fn map_record(row: &Row<'_>) -> rusqlite::Result<MetaRecord> {
    let mod_time: i64 = row.get(3)?;
    let context = match row.get::<_, Value>(9)? {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    Ok(MetaRecord {
        path: row.get(0)?,
        dir: row.get(1)?,
        size: row.get::<_, i64>(2)?.max(0) as u64,
        mod_time: Utc.timestamp_nanos(mod_time),
        label: row.get(4)?,
        tags: json_list(row.get(5)?),
        star: row.get::<_, i64>(6)? != 0,
        icons: json_list(row.get(7)?),
        old_loc: row.get(8)?,
        context,
    })
}

fn nanos(record: &MetaRecord) -> i64 {
    record.mod_time.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn upsert_on(conn: &Connection, record: &MetaRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO meta (path, dir, size, mod_time, label, tags, star, icons, old_loc, context)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(path) DO UPDATE SET
             dir = excluded.dir,
             size = excluded.size,
             mod_time = excluded.mod_time,
             label = excluded.label,
             tags = excluded.tags,
             star = excluded.star,
             icons = excluded.icons,
             old_loc = excluded.old_loc,
             context = excluded.context",
        params![
            record.path,
            record.dir,
            record.size as i64,
            nanos(record),
            record.label,
            serde_json::to_string(&record.tags)?,
            record.star as i64,
            serde_json::to_string(&record.icons)?,
            record.old_loc,
            serde_json::to_string(&record.context)?,
        ],
    )
    .map_err(MetaError::Database)?;
    Ok(())
}

impl<'a> Repository<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS meta (
                path TEXT PRIMARY KEY,
                dir TEXT NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                mod_time INTEGER NOT NULL DEFAULT 0,
                label TEXT NOT NULL DEFAULT '',
                tags TEXT NOT NULL DEFAULT '[]',
                star INTEGER NOT NULL DEFAULT 0,
                icons TEXT NOT NULL DEFAULT '[]',
                old_loc TEXT NOT NULL DEFAULT '',
                context TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_meta_dir ON meta(dir);
        "#).map_err(MetaError::Database)?;
        Ok(())
    }

    pub fn get(&self, path: &str) -> Result<Option<MetaRecord>> {
        let sql = format!("SELECT {} FROM meta WHERE path = ?1", COLUMNS);
        let mut stmt = self.conn.prepare_cached(&sql)?;
        match stmt.query_row(params![path], map_record) {
            Ok(r) => Ok(Some(r)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(MetaError::Database(e)),
        }
    }

    pub fn upsert(&self, record: &MetaRecord) -> Result<()> {
        upsert_on(&*self.conn, record)
    }

    /// Refresh the observed fields only. Returns false when no row exists.
    pub fn update_stat(&self, path: &str, size: u64, mod_time: chrono::DateTime<Utc>) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE meta SET size = ?2, mod_time = ?3 WHERE path = ?1",
            params![path, size as i64, mod_time.timestamp_nanos_opt().unwrap_or(i64::MAX)],
        )?;
        Ok(rows > 0)
    }

    pub fn list(&self, prefix: &str) -> Result<Vec<MetaRecord>> {
        let (p, len, slash) = prefix_params(prefix);
        let sql = format!("SELECT {} FROM meta WHERE {} ORDER BY path", COLUMNS, UNDER_PREFIX);
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![p, len, slash], map_record)?;
        let mut results = Vec::new();
        for r in rows {
            results.push(r?);
        }
        Ok(results)
    }

    /// One page of paths under `prefix`, in path order, strictly after `after`.
    pub fn page_paths(&self, prefix: &str, after: &str, limit: usize) -> Result<Vec<String>> {
        let (p, len, slash) = prefix_params(prefix);
        let sql = format!("SELECT path FROM meta WHERE {} AND path > ?4 ORDER BY path LIMIT ?5", UNDER_PREFIX);
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![p, len, slash, after, limit as i64], |row| row.get::<_, String>(0))?;
        let mut results = Vec::with_capacity(limit);
        for r in rows {
            results.push(r?);
        }
        Ok(results)
    }

    /// Sum of file sizes under `prefix`. Directory records are not counted.
    pub fn sum_file_sizes(&self, prefix: &str) -> Result<u64> {
        let (p, len, slash) = prefix_params(prefix);
        let sql = format!("SELECT COALESCE(SUM(size), 0) FROM meta WHERE dir != path AND {}", UNDER_PREFIX);
        let total: i64 = self.conn.query_row(&sql, params![p, len, slash], |r| r.get(0))?;
        Ok(total.max(0) as u64)
    }

    pub fn distinct_dirs(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT DISTINCT dir FROM meta ORDER BY dir")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut results = Vec::new();
        for r in rows {
            results.push(r?);
        }
        Ok(results)
    }

    pub fn count(&self) -> Result<u64> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM meta", [], |r| r.get(0))?;
        Ok(n as u64)
    }

    /// Remove `prefix` and everything under it.
    pub fn delete_tree(&self, prefix: &str) -> Result<usize> {
        let (p, len, slash) = prefix_params(prefix);
        let sql = format!("DELETE FROM meta WHERE {}", UNDER_PREFIX);
        Ok(self.conn.execute(&sql, params![p, len, slash])?)
    }

    pub fn delete_paths(&mut self, batch: &[String]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM meta WHERE path = ?1")?;
            for path in batch {
                removed += stmt.execute(params![path])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Re-key every record under `src` to live under `dst`, in one transaction.
    pub fn move_tree(&mut self, src: &str, dst: &str, mode: OldLocMode) -> Result<usize> {
        let records = self.list(src)?;
        let tx = self.conn.transaction()?;
        {
            let mut delete = tx.prepare("DELETE FROM meta WHERE path = ?1")?;
            for record in &records {
                delete.execute(params![record.path])?;
            }
        }
        for mut record in records.iter().cloned() {
            let was_dir = record.is_dir();
            let origin = record.path.clone();
            record.path = paths::rebase(&origin, src, dst);
            record.dir = if was_dir { record.path.clone() } else { paths::parent(&record.path).to_string() };
            record.old_loc = match mode {
                OldLocMode::Record => origin,
                OldLocMode::Clear => String::new(),
            };
            upsert_on(&tx, &record)?;
        }
        tx.commit()?;
        Ok(records.len())
    }
}
