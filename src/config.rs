//! Runtime configuration.
//!
//! Loaded from a JSON file (every field optional) and then overridden by
//! command line flags. Durations are written as integer milliseconds.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MetaError, Result};

const CONFIG_FILE: &str = "config.json";

/// One title search backend: the query is appended to `url_prefix` and the
/// first capture group of `title_pattern` is taken as the title.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchEndpoint {
    pub url_prefix: String,
    pub title_pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub root: PathBuf,
    pub db_dir: Option<PathBuf>,
    pub trash_dir: String,

    pub meta_host: String,
    pub search_endpoints: Vec<SearchEndpoint>,
    pub public_host: String,
    pub local_store_from: String,
    pub local_store_to: String,

    pub cache_capacity: usize,
    #[serde(with = "millis")]
    pub size_ttl: Duration,
    #[serde(with = "millis")]
    pub title_ttl: Duration,
    #[serde(with = "millis")]
    pub lookup_positive_ttl: Duration,
    #[serde(with = "millis")]
    pub lookup_negative_ttl: Duration,
    #[serde(with = "millis")]
    pub search_positive_ttl: Duration,
    #[serde(with = "millis")]
    pub search_negative_ttl: Duration,
    #[serde(with = "millis")]
    pub response_ttl: Duration,

    #[serde(with = "millis")]
    pub settle_interval: Duration,
    pub max_passes: u32,
    #[serde(with = "millis")]
    pub reindex_wait: Duration,

    pub enrich_workers: usize,
    #[serde(with = "millis")]
    pub enrich_deadline: Duration,
    pub size_workers: usize,
    pub title_workers: usize,
    pub queue_capacity: usize,
    #[serde(with = "millis")]
    pub size_deadline: Duration,

    #[serde(with = "millis")]
    pub http_timeout: Duration,
    pub http_retries: u32,
    #[serde(with = "millis")]
    pub http_retry_wait_max: Duration,

    #[serde(with = "millis")]
    pub maintenance_interval: Duration,
    pub watch: bool,
    #[serde(with = "millis")]
    pub watch_debounce: Duration,

    pub legacy_sidecar: bool,
}

impl Default for Config {
    fn default() -> Self {
        const HOUR: u64 = 3600;
        const DAY: u64 = 24 * HOUR;
        Self {
            root: PathBuf::new(),
            db_dir: None,
            trash_dir: ".Trash".to_string(),

            meta_host: String::new(),
            search_endpoints: Vec::new(),
            public_host: String::new(),
            local_store_from: "https://s3.us-west-1.wasabisys.com/".to_string(),
            local_store_to: "https://wasabi.local/".to_string(),

            cache_capacity: 20_000,
            size_ttl: Duration::from_secs(HOUR),
            title_ttl: Duration::from_secs(DAY),
            lookup_positive_ttl: Duration::from_secs(30 * DAY),
            lookup_negative_ttl: Duration::from_secs(36_000),
            search_positive_ttl: Duration::from_secs(30 * DAY),
            search_negative_ttl: Duration::from_secs(10 * DAY),
            response_ttl: Duration::from_secs(HOUR),

            settle_interval: Duration::from_secs(10),
            max_passes: 64,
            reindex_wait: Duration::from_millis(100),

            enrich_workers: 20,
            enrich_deadline: Duration::from_millis(500),
            size_workers: 1,
            title_workers: 1,
            queue_capacity: 1024,
            size_deadline: Duration::from_secs(1),

            http_timeout: Duration::from_secs(2),
            http_retries: 2,
            http_retry_wait_max: Duration::from_secs(10),

            maintenance_interval: Duration::from_secs(HOUR),
            watch: true,
            watch_debounce: Duration::from_millis(500),

            legacy_sidecar: true,
        }
    }
}

impl Config {
    /// Defaults rooted at `root`.
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), ..Self::default() }
    }

    /// Load from an explicit file, or from the user config directory when
    /// present, or fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let candidate = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path().filter(|p| p.exists()),
        };

        let Some(file) = candidate else {
            return Ok(Self::default());
        };

        let raw = std::fs::read_to_string(&file).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MetaError::NotFound(format!("config file {}", file.display()))
            } else {
                MetaError::Io(e)
            }
        })?;
        let config: Config = serde_json::from_str(&raw)?;
        tracing::info!("[Config] Loaded {}", file.display());
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("kfs-meta").join(CONFIG_FILE))
    }

    /// Location of the metadata database for this root.
    pub fn db_path(&self) -> PathBuf {
        match &self.db_dir {
            Some(dir) => dir.join(crate::storage::DB_FILE_NAME),
            None => self.root.join(crate::storage::LEGACY_DB_FILE_NAME),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(MetaError::InvalidRequest("root directory is not configured".into()));
        }
        if !self.root.is_dir() {
            return Err(MetaError::InvalidPath(format!("{} is not a directory", self.root.display())));
        }
        if self.enrich_workers == 0 || self.size_workers == 0 || self.title_workers == 0 {
            return Err(MetaError::InvalidRequest("worker counts must be positive".into()));
        }
        if self.cache_capacity == 0 {
            return Err(MetaError::InvalidRequest("cache_capacity must be positive".into()));
        }
        if crate::core::paths::checked(&self.trash_dir)?.is_empty() {
            return Err(MetaError::InvalidRequest(format!("trash_dir {:?} must name a directory below the root", self.trash_dir)));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.json");
        std::fs::write(&file, r#"{"root": "/srv/media", "enrich_deadline": 250, "watch": false}"#).unwrap();

        let config = Config::load(Some(&file)).unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/media"));
        assert_eq!(config.enrich_deadline, Duration::from_millis(250));
        assert!(!config.watch);
        assert_eq!(config.cache_capacity, 20_000);
        assert_eq!(config.trash_dir, ".Trash");
    }

    #[test]
    fn test_missing_explicit_file_is_not_found() {
        let err = Config::load(Some(Path::new("/definitely/not/here.json"))).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_trash_dir_must_be_below_root() {
        let root = tempfile::tempdir().unwrap();
        let mut config = Config::for_root(root.path());
        assert!(config.validate().is_ok());

        for bad in ["/", "", "./", "../elsewhere"] {
            config.trash_dir = bad.to_string();
            assert!(config.validate().is_err(), "{:?} accepted", bad);
        }
    }

    #[test]
    fn test_db_path_prefers_db_dir() {
        let mut config = Config::for_root("/srv/media");
        assert_eq!(config.db_path(), PathBuf::from("/srv/media/.kfs.db"));
        config.db_dir = Some(PathBuf::from("/var/lib/kfs"));
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/kfs/kfs.db"));
    }
}
