//! The Bouncer: decides which directory entries are shown to people.
//!
//! Two kinds of entries are turned away:
//! 1. Internal files (the metadata database, its journals, sidecars). These
//!    are never indexed either, otherwise every write would look like a change.
//! 2. Clutter (companion pages, shortcuts, OS droppings, download padding).

use regex::Regex;
use std::sync::OnceLock;

pub const SIDECAR_FILE_NAME: &str = ".KFS_META";

const INTERNAL_PREFIXES: &[&str] = &[".kfs.db", "kfs.db"];

const HIDDEN_EXTENSIONS: &[&str] = &[
    "mht", "chm", "lnk", "apk", "png", "txt", "todo", "url", "htm", "html", "db", "kfs_meta",
];

const HIDDEN_SUBSTRINGS: &[&str] = &["padding_file", ".DS_Store", ".kfs.db", "996gg.cc"];

fn nfs_silly_rename() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\.nfs\w{24}").expect("static regex"))
}

pub struct Bouncer;

impl Bouncer {
    /// Files owned by the store itself.
    pub fn is_internal(name: &str) -> bool {
        name.starts_with(SIDECAR_FILE_NAME)
            || INTERNAL_PREFIXES.iter().any(|p| name == *p || name.starts_with(&format!("{}-", p)) || name.starts_with(&format!("{}.", p)))
    }

    /// Decides if an entry should be left out of listings.
    pub fn is_hidden(name: &str) -> bool {
        if Self::is_internal(name) {
            return true;
        }

        if HIDDEN_SUBSTRINGS.iter().any(|s| name.contains(s)) {
            return true;
        }

        if nfs_silly_rename().is_match(name) {
            return true;
        }

        // Extension check from the last dot
        if let Some(idx) = name.rfind('.') {
            if idx + 1 < name.len() {
                let ext = name[idx + 1..].to_lowercase();
                if HIDDEN_EXTENSIONS.contains(&ext.as_str()) {
                    return true;
                }
            }
        }

        false
    }
}
