//! Name classification: canonical lookup keys, loose "searchable" names and
//! media types.

use regex::Regex;
use std::sync::OnceLock;

const NOISE: &[&str] = &["-C_X1080X", "-C_GG5", "[MD]"];
const NOISE_SUFFIXES: &[&str] = &["ch", "-C"];
const FC2_PREFIX: &str = "FC2-PPV";

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp"];
const VIDEO_TYPES: &[(&str, &str)] = &[
    ("mp4", "video/mp4"),
    ("mov", "video/quicktime"),
    ("mkv", "video/mp4"),
    ("ts", "video/MP2T"),
];

struct Patterns {
    gitchu: Regex,
    ibw: Regex,
    keys: Vec<Regex>,
    searchable: Vec<Regex>,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |p: &str| Regex::new(p).expect("static regex");
        Patterns {
            gitchu: re(r"(?i)(gitchu-\d+)"),
            ibw: re(r"^(IBW-\d+)Z$"),
            keys: [
                r"^[A-Z]+-\d+$",
                r"^\d{3}[A-Z]+-\d+$",
                r"^KIN8-\d+$",
                r"^T28-\d+$",
                r"^ID-\d+$",
                r"^\d+-\d+-CARIB$",
            ]
            .iter()
            .map(|p| re(p))
            .collect(),
            searchable: [r"^[a-zA-Z]{2,4}-\d{2,4}$", r"^zb\d{8}_\d+$"].iter().map(|p| re(p)).collect(),
        }
    })
}

fn extension(name: &str) -> Option<String> {
    let idx = name.rfind('.')?;
    if idx == 0 || idx + 1 == name.len() {
        return None;
    }
    Some(name[idx + 1..].to_lowercase())
}

pub fn is_image(name: &str) -> bool {
    extension(name).is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// MIME type for playable videos.
pub fn video_type(name: &str) -> Option<&'static str> {
    let ext = extension(name)?;
    VIDEO_TYPES.iter().find(|(e, _)| *e == ext).map(|(_, mime)| *mime)
}

fn strip_video_extension(name: &str) -> &str {
    if video_type(name).is_some() {
        if let Some(idx) = name.rfind('.') {
            return &name[..idx];
        }
    }
    name
}

/// Canonical key used for structured metadata lookups, if the name has one.
pub fn canonical_key(name: &str) -> Option<String> {
    let p = patterns();
    let mut name = strip_video_extension(name.trim_end_matches('/')).to_string();

    for noise in NOISE {
        name = name.replace(noise, "");
    }

    if let Some(caps) = p.gitchu.captures(&name) {
        return Some(caps[1].to_string());
    }

    for suffix in NOISE_SUFFIXES {
        if let Some(stripped) = name.strip_suffix(suffix) {
            name = stripped.to_string();
        }
    }

    if name.starts_with(FC2_PREFIX) {
        return name.split('.').next().map(str::to_string);
    }

    if let Some(caps) = p.ibw.captures(&name) {
        return Some(caps[1].to_string());
    }

    p.keys.iter().any(|re| re.is_match(&name)).then_some(name)
}

/// Name suitable for the looser free-text title search.
pub fn searchable_name(name: &str) -> Option<String> {
    let name = name.trim_end_matches('/').replace("--", "-");
    if name.starts_with(FC2_PREFIX) {
        return name.split('.').next().map(str::to_string);
    }
    patterns().searchable.iter().any(|re| re.is_match(&name)).then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_key_plain_ids() {
        assert_eq!(canonical_key("ABC-123").as_deref(), Some("ABC-123"));
        assert_eq!(canonical_key("ABC-123/").as_deref(), Some("ABC-123"));
        assert_eq!(canonical_key("300MIUM-456").as_deref(), Some("300MIUM-456"));
        assert_eq!(canonical_key("010120-001-CARIB").as_deref(), Some("010120-001-CARIB"));
        assert_eq!(canonical_key("holiday photos"), None);
    }

    #[test]
    fn test_canonical_key_strips_noise() {
        assert_eq!(canonical_key("ABC-123-C_X1080X").as_deref(), Some("ABC-123"));
        assert_eq!(canonical_key("[MD]ABC-123").as_deref(), Some("ABC-123"));
        assert_eq!(canonical_key("ABC-123ch").as_deref(), Some("ABC-123"));
        assert_eq!(canonical_key("ABC-123-C").as_deref(), Some("ABC-123"));
        assert_eq!(canonical_key("ABC-123.mp4").as_deref(), Some("ABC-123"));
    }

    #[test]
    fn test_canonical_key_rewrites() {
        assert_eq!(canonical_key("IBW-456Z").as_deref(), Some("IBW-456"));
        assert_eq!(canonical_key("FC2-PPV-1234567.part1").as_deref(), Some("FC2-PPV-1234567"));
        assert_eq!(canonical_key("[x] gitchu-42 extra").as_deref(), Some("gitchu-42"));
    }

    #[test]
    fn test_searchable() {
        assert_eq!(searchable_name("abc-12").as_deref(), Some("abc-12"));
        assert_eq!(searchable_name("abc--12").as_deref(), Some("abc-12"));
        assert_eq!(searchable_name("zb20200101_3").as_deref(), Some("zb20200101_3"));
        assert_eq!(searchable_name("notes"), None);
    }

    #[test]
    fn test_media_types() {
        assert!(is_image("Cover.JPG"));
        assert!(!is_image("clip.mp4"));
        assert_eq!(video_type("clip.MKV"), Some("video/mp4"));
        assert_eq!(video_type("clip.ts"), Some("video/MP2T"));
        assert_eq!(video_type("notes"), None);
    }
}
