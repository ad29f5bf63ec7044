// FILE: src/operations.rs
//! Tree-mutating operations: label, mark, icons, star, delete, restore, unzip.
//!
//! Every request runs under the state's operation mutex, so the store and the
//! legacy sidecars never see two operations interleave.

use std::path::{Path, PathBuf};

use crate::core::paths;
use crate::error::{MetaError, Result};
use crate::protocol::{Action, OperationReport, OperationRequest};
use crate::state::SharedState;
use crate::storage::{MetaRecord, OldLocMode, Sidecar, SidecarEntry};

const DANGER: &str = "danger";

/// Failures that abort the whole request instead of a single item.
fn is_fatal(e: &MetaError) -> bool {
    matches!(e, MetaError::Database(_) | MetaError::Persistence(_) | MetaError::State(_))
}

/// Apply a metadata-only action to a record.
pub fn apply_metadata(record: &mut MetaRecord, action: &Action) {
    match action {
        Action::Label(label) => record.label = label.clone(),
        Action::Mark(level) => match level.as_str() {
            "5" => {
                record.label = DANGER.to_string();
                record.star = true;
            }
            "4" => record.label = DANGER.to_string(),
            other => record.label = other.to_string(),
        },
        Action::Icons(icon) if icon.is_empty() => record.icons.clear(),
        Action::Icons(icon) => record.icons = vec![icon.clone()],
        Action::Star(None) => record.star = !record.star,
        Action::Star(Some(on)) => record.star = *on,
        Action::Delete | Action::Restore | Action::Unzip => {}
    }
}

/// `name`, or `name (n)` with the extension kept, whichever is free in `dir`.
fn unique_name(dir: &Path, name: &str) -> String {
    if !dir.join(name).exists() {
        return name.to_string();
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{}", ext)),
        _ => (name, String::new()),
    };
    (1..)
        .map(|n| format!("{} ({}){}", stem, n, ext))
        .find(|candidate| !dir.join(candidate).exists())
        .unwrap_or_else(|| name.to_string())
}

/// Legacy sidecars stored the original location as an absolute path.
fn legacy_location(root: &Path, raw: &str) -> String {
    let path = Path::new(raw);
    if path.is_absolute() {
        paths::to_key(root, path).unwrap_or_default()
    } else {
        paths::normalize(raw)
    }
}

fn sidecar_dir(state: &SharedState, key: &str) -> PathBuf {
    paths::to_abs(&state.root, paths::parent(key))
}

fn remove_entry(path: &Path, is_dir: bool) -> std::io::Result<()> {
    if is_dir {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

/// Remove everything inside `dir`, returning the entries that could not be
/// removed.
fn empty_dir<F>(dir: &Path, mut remove: F) -> Result<Vec<(PathBuf, std::io::Error)>>
where
    F: FnMut(&Path, bool) -> std::io::Result<()>,
{
    let mut failures = Vec::new();
    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        match remove(&path, is_dir) {
            Ok(()) => tracing::info!("[Ops] rm -rf {}", path.display()),
            Err(e) => {
                tracing::warn!("[Ops] rm -rf {} failed: {}", path.display(), e);
                failures.push((path, e));
            }
        }
    }
    Ok(failures)
}

/// Rename `src` to `dst`, then run `update`. The rename is undone when the
/// update fails, so the tree and the store never disagree about the entry.
fn move_then<T>(src: &Path, dst: &Path, update: impl FnOnce() -> Result<T>) -> Result<T> {
    std::fs::rename(src, dst)?;
    match update() {
        Ok(v) => Ok(v),
        Err(e) => {
            if let Err(undo) = std::fs::rename(dst, src) {
                tracing::error!("[Ops] could not move {} back to {}: {}", dst.display(), src.display(), undo);
            }
            Err(e)
        }
    }
}

struct Batch<'a> {
    state: &'a SharedState,
    dir_key: String,
    trash: String,
    sidecar: Option<Sidecar>,
    sidecar_dirty: bool,
    touched_trash: bool,
    reindex: Vec<String>,
}

impl<'a> Batch<'a> {
    fn new(state: &'a SharedState, dir_key: String) -> Self {
        let sidecar = state
            .config
            .legacy_sidecar
            .then(|| Sidecar::load(&paths::to_abs(&state.root, &dir_key)));
        Self {
            trash: state.trash_key(),
            state,
            dir_key,
            sidecar,
            sidecar_dirty: false,
            touched_trash: false,
            reindex: Vec::new(),
        }
    }

    /// The trash key. An empty key would put the whole tree "inside the
    /// trash" and turn every delete into a permanent one.
    fn trash(&self) -> Result<String> {
        if self.trash.is_empty() {
            return Err(MetaError::State("trash directory resolves to the tree root".into()));
        }
        Ok(self.trash.clone())
    }

    fn legacy_entry(&self, name: &str) -> Option<SidecarEntry> {
        self.sidecar.as_ref().and_then(|s| s.get(name))
    }

    fn mirror(&mut self, name: &str, record: &MetaRecord) {
        if let Some(sidecar) = self.sidecar.as_mut() {
            sidecar.set(name, SidecarEntry::from_record(record));
            self.sidecar_dirty = true;
        }
    }

    fn forget(&mut self, name: &str) {
        if let Some(sidecar) = self.sidecar.as_mut() {
            if sidecar.remove(name).is_some() {
                self.sidecar_dirty = true;
            }
        }
    }

    /// Record for `key`, created from the filesystem when missing. A fresh
    /// record picks up whatever the legacy sidecar knew about the entry.
    async fn record_for(&self, name: &str, key: &str) -> Result<MetaRecord> {
        if let Some(record) = self.state.store.get(key)? {
            return Ok(record);
        }
        let indexer = std::sync::Arc::clone(&self.state.indexer);
        let owned = key.to_string();
        let mut record = tokio::task::spawn_blocking(move || indexer.load_path(&owned))
            .await
            .map_err(|e| MetaError::State(format!("load panicked: {}", e)))??;
        if let Some(legacy) = self.legacy_entry(name) {
            legacy.apply_to(&mut record);
            self.state.store.set(&record)?;
        }
        Ok(record)
    }

    async fn apply_one(&mut self, name: &str, action: &Action) -> Result<()> {
        if name.is_empty() || name.contains('/') || name == ".." || name == "." {
            return Err(MetaError::InvalidPath(name.to_string()));
        }
        let key = paths::join(&self.dir_key, name);
        let mut record = self.record_for(name, &key).await?;

        match action {
            Action::Delete => self.delete(name, &key, record).await,
            Action::Restore => self.restore(name, &key, record),
            Action::Unzip => self.unzip(name, &key).await,
            _ => {
                apply_metadata(&mut record, action);
                self.state.store.set(&record)?;
                self.mirror(name, &record);
                Ok(())
            }
        }
    }

    async fn delete(&mut self, name: &str, key: &str, record: MetaRecord) -> Result<()> {
        let state = self.state;
        let trash = self.trash()?;
        let abs = paths::to_abs(&state.root, key);
        self.touched_trash = true;

        if key == trash {
            let failures = empty_dir(&abs, remove_entry)?;
            let emptied = state.indexer.remove_orphan(&[trash.clone()])?;
            tracing::info!("[Ops] emptied trash, {} record(s) dropped", emptied);
            if let Some((_, first)) = failures.first() {
                let names: Vec<String> = failures.iter().map(|(p, _)| p.display().to_string()).collect();
                return Err(MetaError::Io(std::io::Error::new(
                    first.kind(),
                    format!("could not remove {}: {}", names.join(", "), first),
                )));
            }
            return Ok(());
        }

        if paths::is_under(&trash, key) {
            if record.is_dir() {
                std::fs::remove_dir_all(&abs)?;
            } else {
                std::fs::remove_file(&abs)?;
            }
            state.store.delete(key)?;
            self.forget(name);
            state.caches.invalidate_sizes_around(key);
            tracing::info!("[Ops] permanently deleted {}", key);
            return Ok(());
        }

        let trash_abs = paths::to_abs(&state.root, &trash);
        std::fs::create_dir_all(&trash_abs)?;
        let dst_name = unique_name(&trash_abs, name);
        let dst_key = paths::join(&trash, &dst_name);
        move_then(&abs, &trash_abs.join(&dst_name), || state.store.move_tree(key, &dst_key, OldLocMode::Record))?;
        tracing::info!("[Ops] mv {} {}", key, dst_key);

        state.caches.invalidate_sizes_around(key);
        state.caches.invalidate_sizes_around(&dst_key);

        self.forget(name);
        if state.config.legacy_sidecar {
            let mut moved = record;
            moved.old_loc = key.to_string();
            let mut trash_sidecar = Sidecar::load(&trash_abs);
            trash_sidecar.set(&dst_name, SidecarEntry::from_record(&moved));
            trash_sidecar.write().map_err(|e| MetaError::Persistence(format!("trash sidecar: {}", e)))?;
        }
        Ok(())
    }

    fn restore(&mut self, name: &str, key: &str, record: MetaRecord) -> Result<()> {
        let state = self.state;
        let trash = self.trash()?;
        if key == trash || !paths::is_under(&trash, key) {
            return Err(MetaError::InvalidRequest(format!("{} is not in the trash", key)));
        }

        let old_loc = match record.old_loc.as_str() {
            "" => self.legacy_entry(name).map(|e| legacy_location(&state.root, &e.old_loc)).unwrap_or_default(),
            loc => loc.to_string(),
        };
        if old_loc.is_empty() {
            return Err(MetaError::InvalidRequest(format!("{} has no original location", key)));
        }

        let dst = paths::to_abs(&state.root, &old_loc);
        if dst.exists() {
            return Err(MetaError::InvalidRequest(format!("{} already exists", old_loc)));
        }
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        move_then(&paths::to_abs(&state.root, key), &dst, || state.store.move_tree(key, &old_loc, OldLocMode::Clear))?;
        tracing::info!("[Ops] mv {} {}", key, old_loc);

        state.caches.invalidate_sizes_around(key);
        state.caches.invalidate_sizes_around(&old_loc);
        self.touched_trash = true;

        self.forget(name);
        if state.config.legacy_sidecar {
            let mut restored = record;
            restored.old_loc.clear();
            let mut dst_sidecar = Sidecar::load(&sidecar_dir(state, &old_loc));
            dst_sidecar.set(paths::base_name(&old_loc), SidecarEntry::from_record(&restored));
            dst_sidecar.write().map_err(|e| MetaError::Persistence(format!("sidecar: {}", e)))?;
        }
        Ok(())
    }

    async fn unzip(&mut self, name: &str, key: &str) -> Result<()> {
        let state = self.state;
        let (stem, ext) = name
            .rsplit_once('.')
            .ok_or_else(|| MetaError::InvalidRequest(format!("{} is not an archive", name)))?;
        let is_zip = match ext.to_lowercase().as_str() {
            "zip" => true,
            "rar" => false,
            _ => return Err(MetaError::InvalidRequest(format!("{} is not an archive", name))),
        };
        let abs = paths::to_abs(&state.root, key);
        let out_key = paths::join(&self.dir_key, stem);
        let out = paths::to_abs(&state.root, &out_key);
        std::fs::create_dir_all(&out)?;

        let mut cmd = if is_zip {
            let mut c = tokio::process::Command::new("unzip");
            c.arg("-o").arg(&abs).arg("-d").arg(&out);
            c
        } else {
            let mut c = tokio::process::Command::new("unrar");
            c.arg("x").arg("-o+").arg(&abs).arg(format!("{}/", out.display()));
            c
        };

        tracing::info!("[Ops] extracting {} into {}", key, out_key);
        let status = cmd.kill_on_drop(true).status().await?;
        if !status.success() {
            return Err(MetaError::Other(anyhow::anyhow!("extracting {} exited with {}", name, status)));
        }
        state.caches.invalidate_size_chain(&out_key);
        self.reindex.push(out_key);
        Ok(())
    }

    async fn finish(self) -> Result<()> {
        let state = self.state;
        if self.sidecar_dirty {
            if let Some(sidecar) = &self.sidecar {
                sidecar.write().map_err(|e| MetaError::Persistence(format!("sidecar: {}", e)))?;
            }
        }

        let mut prefixes = self.reindex;
        if self.touched_trash {
            state.caches.invalidate_sizes_around(&self.trash);
            prefixes.push(self.trash.clone());
        }
        if prefixes.is_empty() {
            return Ok(());
        }

        let indexer = std::sync::Arc::clone(&state.indexer);
        tokio::task::spawn_blocking(move || -> Result<()> {
            indexer.remove_orphan(&prefixes)?;
            indexer.index(&prefixes)?;
            Ok(())
        })
        .await
        .map_err(|e| MetaError::State(format!("reindex panicked: {}", e)))?
    }
}

pub struct Operations;

impl Operations {
    /// Apply `req.action` to every selected entry of `req.dir`.
    pub async fn apply(state: &SharedState, req: &OperationRequest) -> Result<OperationReport> {
        let action = Action::parse(&req.action)?;
        let dir_key = paths::checked(&req.dir)?;

        let _guard = state.op_lock.lock().await;
        let mut batch = Batch::new(state, dir_key);
        let mut report = OperationReport::default();

        for name in req.selected() {
            match batch.apply_one(name, &action).await {
                Ok(()) => report.applied.push(name.to_string()),
                Err(e) if is_fatal(&e) => {
                    tracing::error!("[Ops] {} on {} aborted: {}", req.action, name, e);
                    // Items already applied still get their sidecar and sweep
                    if let Err(flush) = batch.finish().await {
                        tracing::error!("[Ops] flushing after abort failed: {}", flush);
                    }
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!("[Ops] {} on {} failed: {}", req.action, name, e);
                    report.fail(name, e);
                }
            }
        }

        batch.finish().await?;
        tracing::info!(
            "[Ops] {} in {:?}: {} applied, {} failed",
            req.action,
            req.dir,
            report.applied.len(),
            report.failed.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record() -> MetaRecord {
        MetaRecord::observed("a/x", false, 1, Utc::now())
    }

    #[test]
    fn test_mark_levels() {
        let mut r = record();
        apply_metadata(&mut r, &Action::Mark("5".into()));
        assert_eq!(r.label, "danger");
        assert!(r.star);

        let mut r = record();
        apply_metadata(&mut r, &Action::Mark("4".into()));
        assert_eq!(r.label, "danger");
        assert!(!r.star);

        apply_metadata(&mut r, &Action::Mark("info".into()));
        assert_eq!(r.label, "info");
    }

    #[test]
    fn test_star_and_icons() {
        let mut r = record();
        apply_metadata(&mut r, &Action::Star(None));
        assert!(r.star);
        apply_metadata(&mut r, &Action::Star(None));
        assert!(!r.star);
        apply_metadata(&mut r, &Action::Star(Some(true)));
        assert!(r.star);

        apply_metadata(&mut r, &Action::Icons("fire".into()));
        assert_eq!(r.icons, vec!["fire"]);
        apply_metadata(&mut r, &Action::Icons(String::new()));
        assert!(r.icons.is_empty());
    }

    #[test]
    fn test_legacy_location() {
        let root = Path::new("/srv/tree");
        assert_eq!(legacy_location(root, "/srv/tree/a/b.mp4"), "a/b.mp4");
        assert_eq!(legacy_location(root, "/elsewhere/b.mp4"), "");
        assert_eq!(legacy_location(root, "a/b.mp4/"), "a/b.mp4");
    }

    #[test]
    fn test_unique_name_keeps_extension() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(unique_name(dir.path(), "a.mp4"), "a.mp4");
        std::fs::write(dir.path().join("a.mp4"), b"").unwrap();
        assert_eq!(unique_name(dir.path(), "a.mp4"), "a (1).mp4");
        std::fs::write(dir.path().join("a (1).mp4"), b"").unwrap();
        assert_eq!(unique_name(dir.path(), "a.mp4"), "a (2).mp4");
        std::fs::create_dir(dir.path().join("folder")).unwrap();
        assert_eq!(unique_name(dir.path(), "folder"), "folder (1)");
    }

    #[test]
    fn test_empty_dir_reports_entries_it_could_not_remove() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gone"), b"x").unwrap();
        std::fs::write(dir.path().join("stuck"), b"x").unwrap();
        std::fs::create_dir_all(dir.path().join("sub/deep")).unwrap();

        let failures = empty_dir(dir.path(), |path, is_dir| {
            if path.ends_with("stuck") {
                return Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"));
            }
            remove_entry(path, is_dir)
        })
        .unwrap();

        assert_eq!(failures.len(), 1);
        assert!(failures[0].0.ends_with("stuck"));
        assert_eq!(failures[0].1.kind(), std::io::ErrorKind::PermissionDenied);
        assert!(dir.path().join("stuck").exists());
        assert!(!dir.path().join("gone").exists());
        assert!(!dir.path().join("sub").exists());
    }

    #[test]
    fn test_move_is_undone_when_the_store_update_fails() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("clip.mp4");
        let dst = dir.path().join("moved.mp4");
        std::fs::write(&src, b"x").unwrap();

        let err = move_then(&src, &dst, || -> Result<()> { Err(MetaError::Persistence("disk full".into())) });
        assert!(matches!(err, Err(MetaError::Persistence(_))));
        assert!(src.exists());
        assert!(!dst.exists());

        assert_eq!(move_then(&src, &dst, || Ok(7)).unwrap(), 7);
        assert!(dst.exists());
    }
}
