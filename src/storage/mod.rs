// FILE: src/storage/mod.rs
pub mod connection;
pub mod repository;
pub mod sidecar;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::paths;

pub use repository::{OldLocMode, Repository};
pub use sidecar::{Sidecar, SidecarEntry};
pub use store::MetaStore;

/// Database file when a dedicated database directory is configured.
pub const DB_FILE_NAME: &str = "kfs.db";
/// Database file kept inside the tree root.
pub const LEGACY_DB_FILE_NAME: &str = ".kfs.db";

/// Context key holding a resolved title.
pub const CONTEXT_TITLE: &str = "Title";

// Data Types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaRecord {
    pub path: String,
    pub dir: String,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    pub label: String,
    pub tags: Vec<String>,
    pub star: bool,
    pub icons: Vec<String>,
    pub old_loc: String,
    pub context: Map<String, Value>,
}

impl MetaRecord {
    /// Fresh record for an observed filesystem entry.
    pub fn observed(path: &str, is_dir: bool, size: u64, mod_time: DateTime<Utc>) -> Self {
        let path = paths::normalize(path);
        let dir = if is_dir { path.clone() } else { paths::parent(&path).to_string() };
        Self {
            path,
            dir,
            size,
            mod_time,
            label: String::new(),
            tags: Vec::new(),
            star: false,
            icons: Vec::new(),
            old_loc: String::new(),
            context: Map::new(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.dir == self.path
    }

    pub fn name(&self) -> &str {
        paths::base_name(&self.path)
    }

    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    /// Trim slashes and sort set-like fields so persisted rows are deterministic.
    pub fn canonicalize(&mut self) {
        self.path = paths::normalize(&self.path);
        self.dir = paths::normalize(&self.dir);
        self.old_loc = paths::normalize(&self.old_loc);
        self.tags.sort();
        self.tags.dedup();
        self.icons.sort();
        self.icons.dedup();
    }
}

impl std::fmt::Display for MetaRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (dir: {}, size: {})", self.path, self.dir, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observed_dir_field() {
        let now = Utc::now();
        let file = MetaRecord::observed("/a/b/f1", false, 10, now);
        assert_eq!(file.path, "a/b/f1");
        assert_eq!(file.dir, "a/b");
        assert!(!file.is_dir());

        let dir = MetaRecord::observed("a/b", true, 4096, now);
        assert_eq!(dir.dir, "a/b");
        assert!(dir.is_dir());

        let top = MetaRecord::observed("f0", false, 1, now);
        assert_eq!(top.dir, "");
    }

    #[test]
    fn test_canonicalize_sorts() {
        let mut rec = MetaRecord::observed("x", false, 0, Utc::now());
        rec.tags = vec!["b".into(), "a".into(), "b".into()];
        rec.icons = vec!["z".into(), "y".into()];
        rec.old_loc = "/movies/x".into();
        rec.canonicalize();
        assert_eq!(rec.tags, vec!["a", "b"]);
        assert_eq!(rec.icons, vec!["y", "z"]);
        assert_eq!(rec.old_loc, "movies/x");
    }
}
