//! Legacy per-directory metadata file (`.KFS_META`).
//!
//! Older deployments kept labels, stars and trash locations in a JSON file
//! inside each directory. It is still written alongside the store so those
//! readers keep working, and read as a fallback when no record exists.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::core::bouncer::SIDECAR_FILE_NAME;
use crate::error::Result;
use crate::storage::MetaRecord;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SidecarEntry {
    pub label: String,
    pub tags: Vec<String>,
    pub star: bool,
    pub icons: Vec<String>,
    pub old_loc: String,
    pub context: Map<String, Value>,
}

impl SidecarEntry {
    fn sorted(mut self) -> Self {
        self.tags.sort();
        self.icons.sort();
        self
    }

    pub fn from_record(record: &MetaRecord) -> Self {
        Self {
            label: record.label.clone(),
            tags: record.tags.clone(),
            star: record.star,
            icons: record.icons.clone(),
            old_loc: record.old_loc.clone(),
            context: record.context.clone(),
        }
        .sorted()
    }

    /// Copy the user-facing fields onto a record.
    pub fn apply_to(&self, record: &mut MetaRecord) {
        record.label = self.label.clone();
        record.tags = self.tags.clone();
        record.star = self.star;
        record.icons = self.icons.clone();
        record.old_loc = self.old_loc.clone();
        for (k, v) in &self.context {
            record.context.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct SidecarFile {
    root: String,
    meta_info: BTreeMap<String, SidecarEntry>,
}

#[derive(Debug, Clone)]
pub struct Sidecar {
    dir: PathBuf,
    entries: BTreeMap<String, SidecarEntry>,
}

impl Sidecar {
    pub fn file_path(dir: &Path) -> PathBuf {
        dir.join(SIDECAR_FILE_NAME)
    }

    /// Load the sidecar of `dir`. A missing or unreadable file is an empty sidecar.
    pub fn load(dir: &Path) -> Self {
        let entries = match std::fs::read(Self::file_path(dir)) {
            Ok(bytes) => match serde_json::from_slice::<SidecarFile>(&bytes) {
                Ok(file) => file.meta_info,
                Err(e) => {
                    tracing::warn!("[Sidecar] Ignoring malformed {}: {}", Self::file_path(dir).display(), e);
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self { dir: dir.to_path_buf(), entries }
    }

    pub fn get(&self, name: &str) -> Option<SidecarEntry> {
        self.entries.get(name).cloned().map(SidecarEntry::sorted)
    }

    pub fn set(&mut self, name: &str, entry: SidecarEntry) {
        self.entries.insert(name.to_string(), entry.sorted());
    }

    pub fn remove(&mut self, name: &str) -> Option<SidecarEntry> {
        self.entries.remove(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persist atomically: write a temp file, then rename over the old one.
    pub fn write(&self) -> Result<()> {
        let file = SidecarFile {
            root: self.dir.to_string_lossy().into_owned(),
            meta_info: self.entries.iter().map(|(k, v)| (k.clone(), v.clone().sorted())).collect(),
        };
        let data = serde_json::to_vec_pretty(&file)?;
        let target = Self::file_path(&self.dir);
        let tmp = self.dir.join(format!("{}.tmp", SIDECAR_FILE_NAME));
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }
}
