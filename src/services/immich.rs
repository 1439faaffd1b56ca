//! Immich API client with retrying transport and multi-library support.
//!
//! All remote calls funnel through one request primitive: transport errors
//! and 5xx responses are retried with exponential backoff, 4xx responses
//! surface immediately as typed API errors. Exactly one library is active at
//! a time; switching is an explicit, serialized action owned by the
//! orchestrator. Each library gets its own tag identity cache.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use reqwest::{Method, StatusCode};
use serde::Deserialize;

use crate::config::LibraryConfig;
use crate::models::{Asset, BulkTagRequest, CreateTagRequest, Tag, UserInfo};
use crate::services::tag_cache::{self, TagCache};

#[derive(Debug, thiserror::Error)]
pub enum ImmichError {
    /// Network-level failure after exhausting retries.
    #[error("request to Immich failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-2xx response: 4xx immediately, 5xx after exhausting retries.
    #[error("Immich returned HTTP {status}: {body}")]
    Api { status: StatusCode, body: String },

    #[error("invalid library index {index} (have {count} libraries)")]
    InvalidLibrary { index: usize, count: usize },

    #[error("invalid tag name: '{0}'")]
    InvalidTagName(String),

    /// Tag existed remotely during a create race but never showed up in the
    /// refreshed tag list.
    #[error("tag '{0}' reported as existing but not found after refresh")]
    TagResolution(String),
}

impl ImmichError {
    /// A create that lost the race against another actor: the server reports
    /// the name as already taken.
    pub fn is_conflict(&self) -> bool {
        match self {
            ImmichError::Api { status, body } => {
                *status == StatusCode::CONFLICT
                    || body.to_lowercase().contains("already exists")
            }
            _ => false,
        }
    }
}

/// Bounded exponential backoff: `base * 2^attempt`, `max_retries` additional
/// tries beyond the first. Deterministic so tests can assert the schedule.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    assets: SearchPage,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    items: Vec<serde_json::Value>,
    #[serde(default)]
    total: usize,
}

pub struct ImmichClient {
    http: reqwest::Client,
    base_url: String,
    libraries: Vec<LibraryConfig>,
    current: usize,
    retry: RetryPolicy,
    caches: Vec<TagCache>,
}

impl ImmichClient {
    pub fn new(
        base_url: &str,
        libraries: Vec<LibraryConfig>,
        retry: RetryPolicy,
        request_timeout: Duration,
        cache_ttl: Duration,
    ) -> Result<Self, ImmichError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        let caches = libraries.iter().map(|_| TagCache::new(cache_ttl)).collect();
        tracing::info!(
            libraries = libraries.len(),
            names = ?libraries.iter().map(|l| l.name.as_str()).collect::<Vec<_>>(),
            "initialized Immich client"
        );
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            libraries,
            current: 0,
            retry,
            caches,
        })
    }

    pub fn library_count(&self) -> usize {
        self.libraries.len()
    }

    pub fn library_names(&self) -> Vec<String> {
        self.libraries.iter().map(|l| l.name.clone()).collect()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_library_name(&self) -> &str {
        &self.libraries[self.current].name
    }

    fn api_key(&self) -> &str {
        &self.libraries[self.current].api_key
    }

    /// Switch the active library. Logs only when the library actually
    /// changes, so rotation no-ops stay quiet.
    pub fn switch_library(&mut self, index: usize) -> Result<(), ImmichError> {
        let previous = self.current;
        self.switch_library_silent(index)?;
        if previous != index {
            tracing::info!(
                from = %self.libraries[previous].name,
                to = %self.libraries[index].name,
                position = format!("{}/{}", index + 1, self.libraries.len()),
                "switched library"
            );
        }
        Ok(())
    }

    /// Silent variant for health probing: no logging, no cache mutation.
    pub fn switch_library_silent(&mut self, index: usize) -> Result<(), ImmichError> {
        if index >= self.libraries.len() {
            return Err(ImmichError::InvalidLibrary {
                index,
                count: self.libraries.len(),
            });
        }
        self.current = index;
        Ok(())
    }

    /// Advance to the next library in rotation order.
    pub fn next_library(&mut self) -> Result<(), ImmichError> {
        let next = (self.current + 1) % self.libraries.len();
        self.switch_library(next)
    }

    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, ImmichError> {
        self.request_inner(method, endpoint, body, false).await
    }

    async fn request_silent(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, ImmichError> {
        self.request_inner(method, endpoint, body, true).await
    }

    /// The single retrying request primitive. Retries transport errors and
    /// 5xx with exponential backoff; 4xx is never retried.
    async fn request_inner(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&serde_json::Value>,
        quiet: bool,
    ) -> Result<reqwest::Response, ImmichError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let started = Instant::now();

        let mut attempt = 0;
        loop {
            let mut request = self
                .http
                .request(method.clone(), &url)
                .header("x-api-key", self.api_key());
            if let Some(json) = body {
                request = request.json(json);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    metrics::counter!("immich_api_requests_total").increment(1);
                    metrics::histogram!("immich_api_request_seconds")
                        .record(started.elapsed().as_secs_f64());
                    return Ok(response);
                }
                Ok(response) => {
                    let status = response.status();
                    if status.is_server_error() && attempt < self.retry.max_retries {
                        if !quiet {
                            tracing::warn!(
                                %status,
                                attempt = attempt + 1,
                                max_retries = self.retry.max_retries,
                                "server error, retrying"
                            );
                        }
                        tokio::time::sleep(self.retry.delay_for(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    let body = response.text().await.unwrap_or_default();
                    if !quiet {
                        tracing::error!(%method, %url, %status, body, "request failed");
                    }
                    return Err(ImmichError::Api { status, body });
                }
                Err(error) => {
                    if attempt < self.retry.max_retries {
                        if !quiet {
                            tracing::warn!(
                                %error,
                                attempt = attempt + 1,
                                max_retries = self.retry.max_retries,
                                "transport error, retrying"
                            );
                        }
                        tokio::time::sleep(self.retry.delay_for(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    if !quiet {
                        tracing::error!(%error, %url, "request failed after retries");
                    }
                    return Err(ImmichError::Transport(error));
                }
            }
        }
    }

    /// Fetch one server-sized page of image assets carrying no tags at all.
    ///
    /// The "no tags" metadata search is the sole needs-work signal: tagged
    /// assets drop out of it on their own, so there is no cursor to manage.
    pub async fn fetch_untagged_page(&self) -> Result<Vec<Asset>, ImmichError> {
        let library = self.current_library_name().to_string();
        let response = self
            .request(
                Method::POST,
                "/api/search/metadata",
                Some(&serde_json::json!({
                    "tagIds": null,
                    "type": "IMAGE",
                })),
            )
            .await?;

        let page: SearchResponse = response.json().await?;
        let total = page.assets.total;
        let assets = parse_assets(page.assets.items, &library);
        tracing::info!(
            library,
            found = assets.len(),
            total_available = total,
            "fetched untagged image assets"
        );
        Ok(assets)
    }

    /// Assets currently carrying a specific tag.
    pub async fn assets_with_tag(
        &self,
        tag_id: &str,
        limit: usize,
    ) -> Result<Vec<Asset>, ImmichError> {
        let response = self
            .request(
                Method::POST,
                "/api/search/metadata",
                Some(&serde_json::json!({ "tagIds": [tag_id] })),
            )
            .await?;
        let page: SearchResponse = response.json().await?;
        let mut assets = parse_assets(page.assets.items, self.current_library_name());
        assets.truncate(limit);
        Ok(assets)
    }

    pub async fn get_asset(&self, asset_id: &str) -> Result<Asset, ImmichError> {
        let response = self
            .request(Method::GET, &format!("/api/assets/{asset_id}"), None)
            .await?;
        Ok(response.json().await?)
    }

    /// Download asset bytes; thumbnails are preferred for classification
    /// since the models downscale anyway.
    pub async fn download_asset(
        &self,
        asset_id: &str,
        prefer_thumbnail: bool,
    ) -> Result<Vec<u8>, ImmichError> {
        let variant = if prefer_thumbnail { "thumbnail" } else { "original" };
        let response = self
            .request(
                Method::GET,
                &format!("/api/assets/{asset_id}/{variant}"),
                None,
            )
            .await?;
        let bytes = response.bytes().await?;
        tracing::debug!(asset_id, size = bytes.len(), variant, "downloaded asset");
        Ok(bytes.to_vec())
    }

    /// All tags for the active library, served from the cache while fresh.
    /// A stale cache refreshes from source transparently.
    pub async fn all_tags(&mut self) -> Result<Vec<Tag>, ImmichError> {
        if self.caches[self.current].is_fresh() {
            tracing::debug!(count = self.caches[self.current].len(), "using cached tags");
            return Ok(self.cached_tags());
        }
        self.refresh_tags().await?;
        Ok(self.cached_tags())
    }

    fn cached_tags(&self) -> Vec<Tag> {
        let mut tags: Vec<Tag> = self.caches[self.current]
            .iter_values()
            .cloned()
            .collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        tags
    }

    async fn refresh_tags(&mut self) -> Result<(), ImmichError> {
        let response = self.request(Method::GET, "/api/tags", None).await?;
        let tags: Vec<Tag> = response.json().await?;
        tracing::debug!(count = tags.len(), "refreshed tag cache");
        self.caches[self.current].replace_all(tags);
        Ok(())
    }

    pub async fn create_tag(&mut self, name: &str) -> Result<Tag, ImmichError> {
        let body = serde_json::to_value(CreateTagRequest {
            name: name.to_string(),
        })
        .unwrap_or_default();
        let response = self.request(Method::POST, "/api/tags", Some(&body)).await?;
        let tag: Tag = response.json().await?;
        tracing::debug!(tag_id = %tag.id, name = %tag.name, "created tag");
        metrics::counter!("immich_tags_created_total").increment(1);
        self.caches[self.current].insert(tag.clone());
        Ok(tag)
    }

    /// Resolve a tag name to its identity, creating it remotely on a cache
    /// miss. A create that loses the race against another actor triggers one
    /// full cache refresh before giving up.
    pub async fn get_or_create_tag(&mut self, name: &str) -> Result<Tag, ImmichError> {
        if !tag_cache::is_valid_tag_name(name) {
            return Err(ImmichError::InvalidTagName(name.to_string()));
        }
        let clean = name.trim().to_string();

        if !self.caches[self.current].is_fresh() {
            self.refresh_tags().await?;
        }
        if let Some(tag) = self.caches[self.current].get(&clean) {
            metrics::counter!("immich_tag_cache_hits_total").increment(1);
            return Ok(tag.clone());
        }

        metrics::counter!("immich_tag_cache_misses_total").increment(1);
        match self.create_tag(&clean).await {
            Ok(tag) => Ok(tag),
            Err(error) if error.is_conflict() => {
                self.caches[self.current].invalidate();
                self.refresh_tags().await?;
                match self.caches[self.current].get(&clean) {
                    Some(tag) => {
                        tracing::debug!(name = %clean, "found existing tag after cache refresh");
                        Ok(tag.clone())
                    }
                    None => Err(ImmichError::TagResolution(clean)),
                }
            }
            Err(error) => Err(error),
        }
    }

    /// Resolve many names in one pass: cache hits first, at most one list
    /// refresh, then individual creates for the misses. Individual creation
    /// failures are skipped, not fatal — callers get the mappings that
    /// succeeded.
    pub async fn get_or_create_tags_bulk(
        &mut self,
        names: &[String],
    ) -> Result<HashMap<String, Tag>, ImmichError> {
        let valid: Vec<&String> = names
            .iter()
            .filter(|n| tag_cache::is_valid_tag_name(n))
            .collect();
        if valid.len() < names.len() {
            tracing::debug!(
                dropped = names.len() - valid.len(),
                "filtered out invalid tag names"
            );
        }
        if valid.is_empty() {
            return Ok(HashMap::new());
        }

        if !self.caches[self.current].is_fresh() {
            self.refresh_tags().await?;
        }

        let mut resolved = HashMap::new();
        let mut missing = Vec::new();
        for name in valid {
            match self.caches[self.current].get(name) {
                Some(tag) => {
                    metrics::counter!("immich_tag_cache_hits_total").increment(1);
                    resolved.insert(name.clone(), tag.clone());
                }
                None => {
                    metrics::counter!("immich_tag_cache_misses_total").increment(1);
                    missing.push(name.clone());
                }
            }
        }

        // The API has no bulk create; misses go one by one, tolerating
        // individual failures. A collision refresh happens at most once.
        let mut refreshed_on_conflict = false;
        for name in missing {
            let clean = name.trim().to_string();
            match self.create_tag(&clean).await {
                Ok(tag) => {
                    resolved.insert(name, tag);
                }
                Err(error) if error.is_conflict() => {
                    if !refreshed_on_conflict {
                        self.caches[self.current].invalidate();
                        self.refresh_tags().await?;
                        refreshed_on_conflict = true;
                    }
                    if let Some(tag) = self.caches[self.current].get(&clean) {
                        resolved.insert(name, tag.clone());
                    } else {
                        tracing::debug!(name = %clean, "tag exists remotely but not in refreshed cache");
                    }
                }
                Err(error) => {
                    tracing::debug!(name = %clean, %error, "failed to create tag, continuing");
                }
            }
        }

        tracing::debug!(
            requested = names.len(),
            resolved = resolved.len(),
            "bulk tag resolution complete"
        );
        Ok(resolved)
    }

    /// Apply tags to many assets in one idempotent call.
    pub async fn tag_assets_bulk(
        &self,
        asset_ids: &[String],
        tag_ids: &[String],
    ) -> Result<(), ImmichError> {
        if asset_ids.is_empty() || tag_ids.is_empty() {
            return Ok(());
        }
        let body = serde_json::to_value(BulkTagRequest {
            asset_ids: asset_ids.to_vec(),
            tag_ids: tag_ids.to_vec(),
        })
        .unwrap_or_default();
        self.request(Method::PUT, "/api/tags/assets", Some(&body))
            .await?;
        tracing::debug!(
            assets = asset_ids.len(),
            tags = tag_ids.len(),
            "bulk tagged assets"
        );
        Ok(())
    }

    pub async fn tag_asset(&self, asset_id: &str, tag_ids: &[String]) -> Result<(), ImmichError> {
        self.tag_assets_bulk(&[asset_id.to_string()], tag_ids).await
    }

    pub async fn remove_tags_from_asset(
        &self,
        asset_id: &str,
        tag_ids: &[String],
    ) -> Result<(), ImmichError> {
        for tag_id in tag_ids {
            self.request(
                Method::DELETE,
                &format!("/api/tags/{tag_id}/assets/{asset_id}"),
                None,
            )
            .await?;
        }
        if !tag_ids.is_empty() {
            tracing::info!(asset_id, count = tag_ids.len(), "removed tags from asset");
        }
        Ok(())
    }

    pub async fn delete_tag(&mut self, tag_id: &str) -> Result<(), ImmichError> {
        self.request(Method::DELETE, &format!("/api/tags/{tag_id}"), None)
            .await?;
        // The cache is keyed by name, so drop everything.
        self.caches[self.current].invalidate();
        tracing::info!(tag_id, "deleted tag");
        Ok(())
    }

    /// Identity behind the active credential. Silent path — used by health
    /// probing, which must not add log volume.
    pub async fn current_user(&self) -> Result<UserInfo, ImmichError> {
        let response = self
            .request_silent(Method::GET, "/api/users/me", None)
            .await?;
        Ok(response.json().await?)
    }

    /// Connectivity probe via the tag list endpoint.
    pub async fn test_connection(&mut self) -> bool {
        match self.all_tags().await {
            Ok(_) => {
                tracing::info!(library = %self.current_library_name(), "connection test successful");
                true
            }
            Err(error) => {
                tracing::error!(%error, library = %self.current_library_name(), "connection test failed");
                false
            }
        }
    }

    /// Silent connectivity probe: no logging and no cache mutation, so
    /// health checks never perturb orchestration state.
    pub async fn test_connection_silent(&self) -> bool {
        self.request_silent(Method::GET, "/api/tags", None)
            .await
            .is_ok()
    }

    pub fn invalidate_tag_cache(&mut self) {
        self.caches[self.current].invalidate();
        tracing::debug!("tag cache invalidated");
    }
}

fn parse_assets(items: Vec<serde_json::Value>, library: &str) -> Vec<Asset> {
    let mut assets = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<Asset>(item) {
            Ok(asset) => assets.push(asset),
            Err(error) => {
                tracing::warn!(library, %error, "failed to parse asset, skipping");
            }
        }
    }
    assets
}
