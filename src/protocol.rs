// FILE: src/protocol.rs
//! Wire types for listing and operation requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{MetaError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListMode {
    /// Direct children only.
    #[default]
    Read,
    /// Every file under the directory.
    Find,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    Name,
    #[default]
    Modtime,
    Size,
}

impl std::str::FromStr for SortBy {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "name" => Ok(SortBy::Name),
            "modtime" | "" => Ok(SortBy::Modtime),
            "size" => Ok(SortBy::Size),
            other => Err(MetaError::InvalidRequest(format!("unknown sort field {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListingRequest {
    pub path: String,
    pub mode: ListMode,
    pub search: String,
    pub sort_by: SortBy,
    pub sort_desc: bool,
    /// 1-based; 0 is treated as the first page.
    pub page: usize,
    /// 0 means no limit.
    pub limit: usize,
    pub open_with: String,
    pub local_store: bool,
}

impl Default for ListingRequest {
    fn default() -> Self {
        Self {
            path: String::new(),
            mode: ListMode::Read,
            search: String::new(),
            sort_by: SortBy::Modtime,
            sort_desc: true,
            page: 0,
            limit: 0,
            open_with: String::new(),
            local_store: true,
        }
    }
}

impl ListingRequest {
    pub fn is_search(&self) -> bool {
        !self.search.is_empty()
    }

    pub fn walks_tree(&self) -> bool {
        self.mode == ListMode::Find || self.is_search()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub hash: String,
    pub size: u64,
    pub size_human: String,
    /// The directory aggregate is being computed; `size` is a placeholder.
    pub size_pending: bool,
    pub is_dir: bool,
    pub is_image: bool,
    pub mod_time: DateTime<Utc>,
    pub mod_time_human: String,
    pub shortcut_url: String,
    pub description: String,
    pub thumbnail_link: String,
    pub tags: Vec<String>,
    pub label: String,
    pub star: bool,
    pub icons: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingResponse {
    pub dir: String,
    pub up_dir: String,
    pub hash: String,
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperationRequest {
    pub dir: String,
    /// Entry name -> selected.
    pub files: BTreeMap<String, bool>,
    pub action: String,
}

impl OperationRequest {
    pub fn selected(&self) -> impl Iterator<Item = &str> {
        self.files.iter().filter(|(_, on)| **on).map(|(name, _)| name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Label(String),
    Mark(String),
    Icons(String),
    /// `None` toggles.
    Star(Option<bool>),
    Delete,
    Restore,
    Unzip,
}

impl Action {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        match raw.split_once('=') {
            Some(("label", v)) => Ok(Action::Label(v.to_string())),
            Some(("mark", v)) => Ok(Action::Mark(v.to_string())),
            Some(("icons", v)) => Ok(Action::Icons(v.to_string())),
            Some(("star", v)) => Ok(Action::Star(Some(!v.is_empty()))),
            Some((verb, _)) => Err(MetaError::InvalidRequest(format!("unknown action {:?}", verb))),
            None => match raw {
                "delete" => Ok(Action::Delete),
                "restore" => Ok(Action::Restore),
                "unzip" => Ok(Action::Unzip),
                "star" => Ok(Action::Star(None)),
                other => Err(MetaError::InvalidRequest(format!("unknown action {:?}", other))),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFailure {
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationReport {
    pub applied: Vec<String>,
    pub failed: Vec<ItemFailure>,
}

impl OperationReport {
    pub fn fail(&mut self, name: &str, error: impl std::fmt::Display) {
        self.failed.push(ItemFailure { name: name.to_string(), error: error.to_string() });
    }
}

/// Response wrapper: `code` 0 is success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub code: i32,
    pub data: T,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self { code: 0, data }
    }
}

impl Envelope<String> {
    pub fn error(err: &MetaError) -> Self {
        Self { code: err.code(), data: err.to_string() }
    }
}

pub fn respond<T: Serialize>(result: Result<T>) -> Result<Vec<u8>> {
    let body = match result {
        Ok(data) => serde_json::to_vec(&Envelope::ok(data))?,
        Err(e) => serde_json::to_vec(&Envelope::error(&e))?,
    };
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_actions() {
        assert_eq!(Action::parse("delete").unwrap(), Action::Delete);
        assert_eq!(Action::parse("star").unwrap(), Action::Star(None));
        assert_eq!(Action::parse("star=").unwrap(), Action::Star(Some(false)));
        assert_eq!(Action::parse("mark=5").unwrap(), Action::Mark("5".into()));
        assert_eq!(Action::parse("label=danger").unwrap(), Action::Label("danger".into()));
        assert_eq!(Action::parse("icons=").unwrap(), Action::Icons(String::new()));
        assert!(Action::parse("explode").is_err());
        assert!(Action::parse("color=red").is_err());
    }

    #[test]
    fn test_listing_request_defaults() {
        let req: ListingRequest = serde_json::from_str(r#"{"path":"/a","search":"x"}"#).unwrap();
        assert!(req.sort_desc);
        assert_eq!(req.sort_by, SortBy::Modtime);
        assert!(req.walks_tree());

        let req: ListingRequest = serde_json::from_str(r#"{"mode":"find","sortBy":"size","sortDesc":false}"#).unwrap();
        assert_eq!(req.mode, ListMode::Find);
        assert_eq!(req.sort_by, SortBy::Size);
        assert!(!req.sort_desc);
    }

    #[test]
    fn test_selected_files() {
        let req: OperationRequest =
            serde_json::from_str(r#"{"dir":"a","files":{"x":true,"y":false,"z":true},"action":"star"}"#).unwrap();
        assert_eq!(req.selected().collect::<Vec<_>>(), vec!["x", "z"]);
    }

    #[test]
    fn test_error_envelope() {
        let body = respond::<()>(Err(MetaError::NotFound("a/b".into()))).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["code"], 404);
    }
}
