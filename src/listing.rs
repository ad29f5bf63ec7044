// FILE: src/listing.rs
//! Directory listings.
//!
//! A listing is built in three steps: observe the directory (blocking fs
//! work), decorate each entry from the store, the size cache and the legacy
//! sidecar, then hand the page to the enrichment pipeline.

use bytesize::ByteSize;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::core::hash::short_hash;
use crate::core::{naming, paths, Bouncer};
use crate::engine::enrich::EnrichTarget;
use crate::error::{MetaError, Result};
use crate::protocol::{Envelope, FileEntry, ListingRequest, ListingResponse, SortBy};
use crate::state::{GlobalState, SharedState};
use crate::storage::Sidecar;

const STATIC_ROUTE: &str = "/statics";
const SHORT_ROUTE: &str = "/s/";
const PLAYER_ROUTE: &str = "/player?";
const COVER_STEM: &str = "cover.";

struct Observed {
    key: String,
    name: String,
    is_dir: bool,
    size: u64,
    mod_time: DateTime<Utc>,
}

/// Cover image chosen for a directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThumbRef {
    pub dir: String,
    pub path: String,
    pub shortcut_url: String,
}

pub struct Listing;

impl Listing {
    pub async fn list(state: &SharedState, req: &ListingRequest, cancel: &CancellationToken) -> Result<ListingResponse> {
        let dir_key = paths::checked(&req.path)?;
        let root = state.root.clone();
        let walk = req.walks_tree();

        let scan_key = dir_key.clone();
        let observed = tokio::task::spawn_blocking(move || observe_dir(&root, &scan_key, walk))
            .await
            .map_err(|e| MetaError::State(format!("listing scan panicked: {}", e)))??;

        let decorate_state = Arc::clone(state);
        let decorate_req = req.clone();
        let mut files = tokio::task::spawn_blocking(move || decorate(&decorate_state, &observed, &decorate_req))
            .await
            .map_err(|e| MetaError::State(format!("listing decorate panicked: {}", e)))??;
        sort_entries(&mut files, req.sort_by, req.sort_desc);
        if !req.is_search() {
            paginate(&mut files, req.page, req.limit);
        }

        let targets: Vec<EnrichTarget> = files
            .iter()
            .enumerate()
            .map(|(index, f)| EnrichTarget { index, name: f.name.clone(), path: f.path.clone() })
            .collect();
        let started = std::time::Instant::now();
        let (found, report) = state.enricher.enrich(targets, req.local_store, cancel).await;
        tracing::debug!("[Listing] enriched {:?} in {:?}: {:?}", dir_key, started.elapsed(), report);

        for (index, enrichment) in found {
            let Some(entry) = files.get_mut(index) else { continue };
            entry.description = enrichment.description;
            if !enrichment.thumbnail.is_empty() {
                entry.thumbnail_link = enrichment.thumbnail;
            }
            entry.tags.extend(enrichment.tags);
            entry.tags.sort();
            entry.tags.dedup();
        }

        if req.is_search() {
            files.retain(|f| matches_search(f, &req.search));
            sort_entries(&mut files, SortBy::Modtime, true);
            paginate(&mut files, req.page, req.limit);
        }

        Ok(ListingResponse {
            hash: short_hash(&dir_key),
            up_dir: paths::parent(&dir_key).to_string(),
            dir: dir_key,
            files,
        })
    }

    /// Serialized cover reference for a directory, served from the response
    /// cache when the same request was answered recently.
    pub async fn thumb(state: &SharedState, path: &str) -> Result<Arc<Vec<u8>>> {
        let dir_key = paths::checked(path)?;
        let fingerprint = format!("thumb:{}", dir_key);
        if let Some(body) = state.caches.responses.get(&fingerprint) {
            return Ok(body);
        }

        let root = state.root.clone();
        let key = dir_key.clone();
        let cover = tokio::task::spawn_blocking(move || find_cover(&root, &key))
            .await
            .map_err(|e| MetaError::State(format!("thumb scan panicked: {}", e)))??;
        let Some(cover) = cover else {
            return Err(MetaError::NotFound(format!("no image in {:?}", dir_key)));
        };

        let thumb = ThumbRef { shortcut_url: static_url(state, &cover), path: cover, dir: dir_key };
        let body = Arc::new(serde_json::to_vec(&Envelope::ok(thumb))?);
        state.caches.responses.insert(fingerprint, Arc::clone(&body));
        Ok(body)
    }

    /// Target of a short link handed out in a listing.
    pub fn resolve_shortcut(state: &GlobalState, hash: &str) -> Option<String> {
        state.shortcuts.get(hash).map(|v| v.value().clone())
    }
}

fn stat_to_observed(root: &Path, abs: &Path, meta: &std::fs::Metadata) -> Result<Observed> {
    let key = paths::to_key(root, abs)?;
    Ok(Observed {
        name: paths::base_name(&key).to_string(),
        key,
        is_dir: meta.is_dir(),
        size: meta.len(),
        mod_time: meta.modified().map(DateTime::<Utc>::from).unwrap_or_default(),
    })
}

fn observe_dir(root: &Path, dir_key: &str, walk: bool) -> Result<Vec<Observed>> {
    let abs = paths::to_abs(root, dir_key);
    let meta = std::fs::metadata(&abs).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => MetaError::NotFound(dir_key.to_string()),
        _ => MetaError::Io(e),
    })?;
    if !meta.is_dir() {
        return Err(MetaError::InvalidRequest(format!("{:?} is not a directory", dir_key)));
    }

    let mut out = Vec::new();
    if walk {
        let walker = walkdir::WalkDir::new(&abs)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !Bouncer::is_hidden(&e.file_name().to_string_lossy()));
        for entry in walker.flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                out.push(stat_to_observed(root, entry.path(), &meta)?);
            }
        }
    } else {
        for entry in std::fs::read_dir(&abs)? {
            let entry = entry?;
            if Bouncer::is_hidden(&entry.file_name().to_string_lossy()) {
                continue;
            }
            let path: PathBuf = entry.path();
            match std::fs::metadata(&path) {
                Ok(meta) => out.push(stat_to_observed(root, &path, &meta)?),
                Err(e) => tracing::debug!("[Listing] skipping {}: {}", path.display(), e),
            }
        }
    }
    Ok(out)
}

fn decorate(state: &SharedState, observed: &[Observed], req: &ListingRequest) -> Result<Vec<FileEntry>> {
    let mut sidecars: HashMap<String, Sidecar> = HashMap::new();
    let now = Utc::now();
    let mut files = Vec::with_capacity(observed.len());

    for obs in observed {
        let mut entry = FileEntry {
            name: if obs.is_dir { format!("{}/", obs.name) } else { obs.name.clone() },
            path: obs.key.clone(),
            hash: short_hash(&obs.key),
            size: obs.size,
            is_dir: obs.is_dir,
            is_image: !obs.is_dir && naming::is_image(&obs.name),
            mod_time: obs.mod_time,
            mod_time_human: pretty_time(obs.mod_time, now),
            ..FileEntry::default()
        };

        if obs.is_dir && !req.walks_tree() {
            match state.sizer.cached_or_schedule(&obs.key) {
                Some(size) => entry.size = size,
                None => {
                    entry.size = 0;
                    entry.size_pending = true;
                }
            }
        }
        entry.size_human = ByteSize(entry.size).to_string_as(true);

        match state.store.get(&obs.key)? {
            Some(record) => {
                entry.label = record.label;
                entry.star = record.star;
                entry.tags = record.tags;
                entry.icons = record.icons;
            }
            None if state.config.legacy_sidecar => {
                let parent = paths::parent(&obs.key).to_string();
                let sidecar = sidecars
                    .entry(parent.clone())
                    .or_insert_with(|| Sidecar::load(&paths::to_abs(&state.root, &parent)));
                if let Some(legacy) = sidecar.get(&obs.name) {
                    entry.label = legacy.label;
                    entry.star = legacy.star;
                    entry.tags = legacy.tags;
                    entry.icons = legacy.icons;
                }
            }
            None => {}
        }

        entry.shortcut_url = shortcut_url(state, &obs.key, &obs.name, &req.open_with);
        files.push(entry);
    }
    Ok(files)
}

fn find_cover(root: &Path, dir_key: &str) -> Result<Option<String>> {
    let abs = paths::to_abs(root, dir_key);
    let mut images: Vec<String> = std::fs::read_dir(&abs)?
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| !Bouncer::is_internal(name) && naming::is_image(name))
        .collect();
    images.sort();

    let cover = images
        .iter()
        .find(|name| name.to_lowercase().starts_with(COVER_STEM))
        .or_else(|| images.first())
        .map(|name| paths::join(dir_key, name));
    Ok(cover)
}

fn encode_path(key: &str) -> String {
    key.split('/').map(|seg| urlencoding::encode(seg).into_owned()).collect::<Vec<_>>().join("/")
}

fn static_url(state: &GlobalState, key: &str) -> String {
    format!("{}{}/{}", state.config.public_host.trim_end_matches('/'), STATIC_ROUTE, encode_path(key))
}

fn register_shortcut(state: &GlobalState, target: String) -> String {
    let hash = short_hash(&target);
    state.shortcuts.insert(hash.clone(), target);
    hash
}

fn shortcut_url(state: &GlobalState, key: &str, name: &str, open_with: &str) -> String {
    let absolute = static_url(state, key);
    let Some(mime) = naming::video_type(name) else {
        return absolute;
    };

    let host = state.config.public_host.trim_end_matches('/');
    let short = register_shortcut(state, absolute.clone());
    let query = format!(
        "url={}&type={}",
        urlencoding::encode(&format!("{}{}{}", host, SHORT_ROUTE, short)),
        urlencoding::encode(mime)
    );
    match open_with {
        "iina" => format!("iina://open?{}", query),
        "nplayer" => format!("nplayer-{}", absolute),
        "vlc" => format!("vlc://{}", absolute),
        "potplayer" => format!("potplayer://{}", absolute),
        "mxplayer" => format!("intent:{}", absolute),
        "native" => absolute,
        _ => format!("{}{}", PLAYER_ROUTE, query),
    }
}

/// A term matches on the name or any tag; a leading `!` negates.
pub fn matches_search(entry: &FileEntry, term: &str) -> bool {
    let (negate, term) = match term.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, term),
    };
    let hit = entry.name.contains(term) || entry.tags.iter().any(|t| t.contains(term));
    hit != negate
}

pub fn sort_entries(files: &mut [FileEntry], by: SortBy, desc: bool) {
    files.sort_by(|a, b| {
        let ord = match by {
            SortBy::Name => a.name.cmp(&b.name),
            SortBy::Modtime => a.mod_time.cmp(&b.mod_time),
            SortBy::Size => a.size.cmp(&b.size),
        };
        if desc {
            ord.reverse()
        } else {
            ord
        }
    });
}

pub fn paginate(files: &mut Vec<FileEntry>, page: usize, limit: usize) {
    if limit == 0 {
        return;
    }
    let start = (page.max(1) - 1).saturating_mul(limit);
    if start >= files.len() {
        files.clear();
        return;
    }
    files.truncate((start + limit).min(files.len()));
    files.drain(..start);
}

pub fn pretty_time(t: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let since = now.signed_duration_since(t);
    let secs = since.num_seconds();
    match secs {
        s if s < 1 => "1s".to_string(),
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3600),
        _ => t.format("%m-%d-%y").to_string(),
    }
}
