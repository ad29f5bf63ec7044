//! Root-relative path keys.
//!
//! Every record is keyed by a `/`-separated path relative to the tree root,
//! with no leading or trailing slash. The root itself is the empty key.

use std::path::{Component, Path, PathBuf};

use crate::error::{MetaError, Result};

/// Normalize a caller-supplied path into a key.
pub fn normalize(raw: &str) -> String {
    raw.split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Parent key; the root's parent is the root.
pub fn parent(key: &str) -> &str {
    match key.rfind('/') {
        Some(idx) => &key[..idx],
        None => "",
    }
}

/// Final segment of a key.
pub fn base_name(key: &str) -> &str {
    match key.rfind('/') {
        Some(idx) => &key[idx + 1..],
        None => key,
    }
}

pub fn join(dir: &str, name: &str) -> String {
    let name = name.trim_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        dir.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Segment-aware containment: `photos` contains `photos/a` but not `photos2/a`.
pub fn is_under(prefix: &str, key: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    key == prefix
        || (key.len() > prefix.len() && key.starts_with(prefix) && key.as_bytes()[prefix.len()] == b'/')
}

/// The key itself followed by each ancestor up to and including the root.
pub fn ancestry(key: &str) -> Vec<String> {
    let mut chain = vec![key.to_string()];
    let mut current = key;
    while !current.is_empty() {
        current = parent(current);
        chain.push(current.to_string());
    }
    chain
}

/// Rebase `key` from under `src` to under `dst`.
pub fn rebase(key: &str, src: &str, dst: &str) -> String {
    let suffix = key[src.len()..].trim_start_matches('/');
    join(dst, suffix)
}

/// Absolute filesystem path for a key.
pub fn to_abs(root: &Path, key: &str) -> PathBuf {
    if key.is_empty() {
        root.to_path_buf()
    } else {
        root.join(key)
    }
}

/// Key for an absolute path under `root`. Rejects paths outside the root.
pub fn to_key(root: &Path, abs: &Path) -> Result<String> {
    let rel = abs
        .strip_prefix(root)
        .map_err(|_| MetaError::InvalidPath(format!("{} is outside {}", abs.display(), root.display())))?;

    let mut segments = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(seg) => segments.push(seg.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return Err(MetaError::InvalidPath(format!("unsupported component in {}", abs.display()))),
        }
    }
    Ok(segments.join("/"))
}

/// Reject keys that would escape the root.
pub fn checked(raw: &str) -> Result<String> {
    let key = normalize(raw);
    if key.split('/').any(|seg| seg == "..") {
        return Err(MetaError::InvalidPath(raw.to_string()));
    }
    Ok(key)
}
