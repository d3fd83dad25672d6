use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use url::Url;

use crate::error::CrawlError;

/// A unit of crawl work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrawlRequest {
    /// URL to crawl
    pub url: String,

    /// Canonical form of `url` used for deduplication
    pub unique_key: String,

    pub method: String,

    pub headers: HashMap<String, String>,

    /// Arbitrary caller data carried through the crawl
    pub user_data: Value,

    /// Attempts already made; only the queue changes this
    pub retry_count: u32,

    pub max_retries: u32,

    /// Fail on first error instead of retrying
    pub no_retry: bool,

    pub label: Option<String>,

    /// Distance from the seed URL (0 for seeds)
    pub depth: u32,
}

impl CrawlRequest {
    pub fn new(url: impl Into<String>) -> Result<Self, CrawlError> {
        let url = url.into();
        let unique_key = normalize_url(&url)?;

        Ok(Self {
            url,
            unique_key,
            method: "GET".to_string(),
            headers: HashMap::new(),
            user_data: Value::Null,
            retry_count: 0,
            max_retries: 3,
            no_retry: false,
            label: None,
            depth: 0,
        })
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_label(mut self, label: Option<String>) -> Self {
        self.label = label;
        self
    }

    pub fn with_user_data(mut self, user_data: Value) -> Self {
        self.user_data = user_data;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn hostname(&self) -> Option<String> {
        Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_lowercase))
    }

    /// Whether another attempt is allowed after a failure
    pub fn can_retry(&self) -> bool {
        !self.no_retry && self.retry_count < self.max_retries
    }
}

/// Canonicalize a URL so trivially different spellings share one key.
///
/// Lowercases scheme and host, drops default ports, fragments and the
/// trailing slash, and sorts query parameters.
pub fn normalize_url(url: &str) -> Result<String, CrawlError> {
    let parsed = Url::parse(url.trim()).map_err(|_| CrawlError::InvalidUrl(url.to_string()))?;

    let host = parsed
        .host_str()
        .ok_or_else(|| CrawlError::InvalidUrl(url.to_string()))?
        .to_lowercase();

    // `port()` is already None when the port is the scheme default
    let mut normalized = format!("{}://{}", parsed.scheme(), host);
    if let Some(port) = parsed.port() {
        normalized.push_str(&format!(":{}", port));
    }

    let path = parsed.path().trim_end_matches('/');
    normalized.push_str(path);

    if let Some(query) = parsed.query() {
        let mut params: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
        if !params.is_empty() {
            params.sort_by(|a, b| {
                let key_a = a.split('=').next().unwrap_or("");
                let key_b = b.split('=').next().unwrap_or("");
                key_a.cmp(key_b)
            });
            normalized.push('?');
            normalized.push_str(&params.join("&"));
        }
    }

    Ok(normalized)
}
