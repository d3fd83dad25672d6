use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

#[cfg(test)]
use mockall::automock;

use crate::config::BrowserServiceSettings;
use crate::crawler::html;

/// Output of a browser render
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderedContent {
    pub url: String,
    pub html: String,
    /// Visible text extracted from the rendered DOM
    pub text: String,
}

/// Browser rendering collaborator. Only the text length is inspected by the engine.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, url: &str, timeout: Duration) -> Result<RenderedContent>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderServiceRequest {
    pub url: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderServiceResponse {
    pub success: bool,
    pub url: String,
    #[serde(default)]
    pub content: String,
    pub error: Option<String>,
}

/// Renderer backed by an external headless-browser service
pub struct RemoteBrowserService {
    client: Client,
    base_url: String,
}

impl RemoteBrowserService {
    pub fn new(settings: &BrowserServiceSettings) -> Result<Self> {
        let client = Client::builder()
            // Leave headroom above the render deadline
            .timeout(Duration::from_millis(settings.timeout_ms + 5_000))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: settings.url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Renderer for RemoteBrowserService {
    async fn render(&self, url: &str, timeout: Duration) -> Result<RenderedContent> {
        let endpoint = format!("{}/render", self.base_url);
        let request = RenderServiceRequest {
            url: url.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };

        debug!("Sending render request to browser service: {}", url);

        let response = self
            .client
            .post(&endpoint)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to browser service")?
            .json::<RenderServiceResponse>()
            .await
            .context("Failed to parse browser service response")?;

        if !response.success {
            let message = response
                .error
                .unwrap_or_else(|| "unknown error".to_string());
            error!("Browser service error for {}: {}", url, message);
            anyhow::bail!("Browser service error: {}", message);
        }

        let text = html::extract_text(&response.content);

        Ok(RenderedContent {
            url: response.url,
            html: response.content,
            text,
        })
    }
}
