//! External metadata sources.
//!
//! Two seams: a structured lookup by canonical key (`MetadataSource`) and a
//! best-effort free-text title search (`TitleSearch`). Both are traits so the
//! pipeline can run against fakes.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{Config, SearchEndpoint};
use crate::error::{MetaError, Result};

const USER_AGENT: &str = concat!("kfs-meta/", env!("CARGO_PKG_VERSION"));
const RETRY_WAIT_MIN: Duration = Duration::from_millis(200);

/// A confirmed match from the metadata service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MovieMeta {
    pub id: i64,
    pub title: String,
    pub cover: String,
    pub tags: Vec<String>,
    pub liked: bool,
    pub score: i64,
}

/// Cached outcome of a structured lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(MovieMeta),
    Missing,
}

impl Lookup {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }
}

#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// `Ok(None)` means the service answered and has no record for `key`.
    async fn lookup(&self, key: &str) -> Result<Option<MovieMeta>>;
}

#[async_trait]
pub trait TitleSearch: Send + Sync {
    async fn search(&self, name: &str) -> Result<Option<String>>;
}

/// Used when no service is configured.
pub struct Disabled;

#[async_trait]
impl MetadataSource for Disabled {
    async fn lookup(&self, _key: &str) -> Result<Option<MovieMeta>> {
        Ok(None)
    }
}

#[async_trait]
impl TitleSearch for Disabled {
    async fn search(&self, _name: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

// --- Wire format -----------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct Named {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct UserData {
    like: bool,
    score: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct MovieData {
    id: i64,
    title: String,
    backup_cover: String,
    tags: Vec<String>,
    genre: Vec<Named>,
    star: Vec<Named>,
    studio: Named,
    label: Named,
    series: Named,
    director: Named,
    fc2_uploader: Named,
    user_data: UserData,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct MovieResponse {
    code: i64,
    data: Option<MovieData>,
}

impl MovieResponse {
    fn into_meta(self) -> Option<MovieMeta> {
        let data = self.data?;
        if data.id <= 0 {
            return None;
        }
        let mut tags: Vec<String> = data
            .tags
            .into_iter()
            .chain(data.genre.into_iter().map(|g| g.name))
            .chain(data.star.into_iter().map(|s| s.name))
            .chain([data.studio, data.label, data.series, data.director, data.fc2_uploader].into_iter().map(|n| n.name))
            .filter(|t| !t.is_empty())
            .collect();
        tags.sort();
        tags.dedup();
        Some(MovieMeta {
            id: data.id,
            title: data.title,
            cover: data.backup_cover,
            tags,
            liked: data.user_data.like,
            score: data.user_data.score,
        })
    }
}

// --- HTTP plumbing ---------------------------------------------------------

#[derive(Clone)]
struct RetryingClient {
    client: reqwest::Client,
    retries: u32,
    wait_max: Duration,
}

impl RetryingClient {
    fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| MetaError::ExternalService(format!("failed to build http client: {e}")))?;
        Ok(Self { client, retries: config.http_retries, wait_max: config.http_retry_wait_max })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        (RETRY_WAIT_MIN * factor).min(self.wait_max)
    }

    /// GET with bounded retries on transport errors and 5xx responses.
    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let mut attempt = 0;
        loop {
            let failure = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) if resp.status().is_server_error() => format!("{} returned {}", url, resp.status()),
                Ok(resp) => {
                    return Err(MetaError::ExternalService(format!("{} returned {}", url, resp.status())));
                }
                Err(e) => format!("request to {} failed: {}", url, e),
            };

            if attempt >= self.retries {
                return Err(MetaError::ExternalService(failure));
            }
            let wait = self.backoff(attempt);
            tracing::debug!("[Lookup] {} (retrying in {:?})", failure, wait);
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}

/// Structured lookups against `{meta_host}/v1/api`.
pub struct HttpMetadataSource {
    http: RetryingClient,
    base_url: String,
}

impl HttpMetadataSource {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            http: RetryingClient::new(config)?,
            base_url: config.meta_host.trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/v1/api?action=get_movie&name={}&cdn=1", self.base_url, urlencoding::encode(key))
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn lookup(&self, key: &str) -> Result<Option<MovieMeta>> {
        let resp = self.http.get(&self.url_for(key)).await?;
        let body: MovieResponse = resp
            .json()
            .await
            .map_err(|e| MetaError::ExternalService(format!("decode failed for {}: {}", key, e)))?;
        if body.code != 0 {
            tracing::debug!("[Lookup] {} answered code {}", key, body.code);
        }
        Ok(body.into_meta())
    }
}

struct CompiledEndpoint {
    url_prefix: String,
    title: Regex,
}

/// Free-text title search over configured HTML endpoints.
pub struct HttpTitleSearch {
    http: RetryingClient,
    endpoints: Vec<CompiledEndpoint>,
}

impl HttpTitleSearch {
    pub fn new(config: &Config) -> Result<Self> {
        let endpoints = config
            .search_endpoints
            .iter()
            .map(|SearchEndpoint { url_prefix, title_pattern }| {
                Regex::new(title_pattern)
                    .map(|title| CompiledEndpoint { url_prefix: url_prefix.clone(), title })
                    .map_err(|e| MetaError::InvalidRequest(format!("bad title_pattern {:?}: {}", title_pattern, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { http: RetryingClient::new(config)?, endpoints })
    }

    pub fn extract_title(pattern: &Regex, body: &str) -> Option<String> {
        let caps = pattern.captures(body)?;
        let title = caps.get(1).or_else(|| caps.get(0))?.as_str().trim();
        (!title.is_empty()).then(|| title.to_string())
    }
}

#[async_trait]
impl TitleSearch for HttpTitleSearch {
    async fn search(&self, name: &str) -> Result<Option<String>> {
        let mut variants: Vec<String> = Vec::with_capacity(3);
        for v in [name.to_string(), name.to_uppercase(), name.to_lowercase()] {
            if !variants.contains(&v) {
                variants.push(v);
            }
        }

        let mut last_error = None;
        for endpoint in &self.endpoints {
            for variant in &variants {
                let url = format!("{}{}", endpoint.url_prefix, urlencoding::encode(variant));
                match self.http.get(&url).await {
                    Ok(resp) => {
                        let body = resp.text().await?;
                        if let Some(title) = Self::extract_title(&endpoint.title, &body) {
                            return Ok(Some(title));
                        }
                    }
                    Err(e) => last_error = Some(e),
                }
            }
        }

        if let Some(e) = last_error {
            tracing::debug!("[Lookup] title search for {} ended with {}", name, e);
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_positive_match() {
        let raw = r#"{"Code":0,"Data":{"Id":7,"Title":"A Title","BackupCover":"https://img/x.jpg",
            "Tags":["b"],"Genre":[{"Name":"a"}],"Star":[{"Name":"c"},{"Name":""}],
            "Studio":{"Name":"d"},"UserData":{"Like":true,"Score":5}}}"#;
        let meta = serde_json::from_str::<MovieResponse>(raw).unwrap().into_meta().unwrap();
        assert_eq!(meta.id, 7);
        assert_eq!(meta.cover, "https://img/x.jpg");
        assert_eq!(meta.tags, vec!["a", "b", "c", "d"]);
        assert!(meta.liked);
        assert_eq!(meta.score, 5);
    }

    #[test]
    fn test_decode_negative_match() {
        let raw = r#"{"Code":0,"Data":{"Id":0}}"#;
        assert!(serde_json::from_str::<MovieResponse>(raw).unwrap().into_meta().is_none());
        let raw = r#"{"Code":404}"#;
        assert!(serde_json::from_str::<MovieResponse>(raw).unwrap().into_meta().is_none());
    }

    #[test]
    fn test_extract_title() {
        let re = Regex::new(r#"<a title="([^"]+)" href="/view/"#).unwrap();
        let body = r#"<div><a title="Found It" href="/view/123">x</a></div>"#;
        assert_eq!(HttpTitleSearch::extract_title(&re, body).as_deref(), Some("Found It"));
        assert_eq!(HttpTitleSearch::extract_title(&re, "<p>nothing</p>"), None);
    }

    #[test]
    fn test_lookup_url_encodes_key() {
        let config = Config { meta_host: "http://meta.local/".into(), ..Config::default() };
        let source = HttpMetadataSource::new(&config).unwrap();
        assert_eq!(source.url_for("ABC 1"), "http://meta.local/v1/api?action=get_movie&name=ABC%201&cdn=1");
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = Config { http_retry_wait_max: Duration::from_millis(500), ..Config::default() };
        let http = RetryingClient::new(&config).unwrap();
        assert_eq!(http.backoff(0), Duration::from_millis(200));
        assert_eq!(http.backoff(1), Duration::from_millis(400));
        assert_eq!(http.backoff(5), Duration::from_millis(500));
    }
}
