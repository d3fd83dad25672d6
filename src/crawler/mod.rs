pub mod enqueue;
pub mod html;
pub mod http;
pub mod request;
pub mod robots;
pub mod runner;
pub mod smart;
pub mod static_crawler;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

pub use enqueue::{enqueue_links, EnqueueLinksOptions, EnqueueStrategy, SkipReason, SkippedLink, UrlPattern};
pub use request::CrawlRequest;
pub use runner::{CrawlSummary, Crawler, PageHandler};
pub use smart::SmartCrawler;
pub use static_crawler::StaticCrawler;

/// How a page was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderingType {
    /// Plain HTTP fetch is enough
    Static,
    /// Needs browser rendering
    Browser,
}

/// A fetched page handed to link extraction and page handlers
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    /// Final URL after redirects
    pub url: String,
    pub status: u16,
    pub html: String,
    pub rendering: RenderingType,
    /// Session used for a static fetch
    pub session_id: Option<String>,
}

impl FetchedPage {
    pub fn text(&self) -> String {
        html::extract_text(&self.html)
    }

    pub fn links(&self) -> Vec<String> {
        html::extract_links(&self.html, &self.url)
    }
}

/// Per-request fetch strategy
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CrawlerEngine: Send + Sync {
    async fn handle_request(&self, request: &CrawlRequest) -> Result<FetchedPage>;

    fn name(&self) -> &'static str;
}
