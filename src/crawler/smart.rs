use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::browser::remote::{RenderedContent, Renderer};
use crate::config::CrawlerSettings;
use crate::crawler::html;
use crate::crawler::request::CrawlRequest;
use crate::crawler::static_crawler::StaticCrawler;
use crate::crawler::{CrawlerEngine, FetchedPage, RenderingType};
use crate::error::CrawlError;

/// Thresholds deciding when a host needs browser rendering
#[derive(Debug, Clone)]
pub struct RenderingDetection {
    /// Fraction of requests to an unclassified host fetched both ways
    pub sample_ratio: f64,
    /// Browser text must be longer than static text by this factor
    pub required_ratio: f64,
    /// ...and by more than this many characters
    pub required_margin: usize,
    pub render_timeout: Duration,
}

impl RenderingDetection {
    pub fn from_settings(settings: &CrawlerSettings) -> Self {
        Self {
            sample_ratio: settings.rendering_type_detection_ratio,
            required_ratio: settings.browser_required_ratio,
            required_margin: settings.browser_required_margin,
            render_timeout: Duration::from_millis(settings.render_timeout_ms),
        }
    }

    /// Probability of sampling an unclassified host. NaN and infinities disable sampling.
    pub fn sampling_probability(&self) -> f64 {
        if self.sample_ratio.is_finite() {
            self.sample_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    pub fn browser_required(&self, static_len: usize, browser_len: usize) -> bool {
        browser_len as f64 > static_len as f64 * self.required_ratio
            && browser_len.saturating_sub(static_len) > self.required_margin
    }
}

/// Cheap check for pages whose content is produced by JavaScript
pub fn looks_client_rendered(page_html: &str, text: &str) -> bool {
    let len = text.chars().count();
    len < 100 || (len < 500 && html::has_noscript(page_html))
}

/// Crawler that learns, per hostname, whether static fetches are enough
pub struct SmartCrawler {
    static_crawler: StaticCrawler,
    renderer: Option<Arc<dyn Renderer>>,
    detection: RenderingDetection,
    rendering_types: Mutex<HashMap<String, RenderingType>>,
    comparisons: AtomicUsize,
}

impl SmartCrawler {
    pub fn new(
        static_crawler: StaticCrawler,
        renderer: Option<Arc<dyn Renderer>>,
        detection: RenderingDetection,
    ) -> Self {
        if renderer.is_none() {
            debug!("No browser renderer configured, smart crawler will only fetch statically");
        }

        Self {
            static_crawler,
            renderer,
            detection,
            rendering_types: Mutex::new(HashMap::new()),
            comparisons: AtomicUsize::new(0),
        }
    }

    pub async fn rendering_type(&self, hostname: &str) -> Option<RenderingType> {
        self.rendering_types.lock().await.get(hostname).copied()
    }

    /// Number of static/browser comparisons made so far
    pub fn comparison_count(&self) -> usize {
        self.comparisons.load(Ordering::SeqCst)
    }

    fn should_sample(&self) -> bool {
        rand::thread_rng().gen_bool(self.detection.sampling_probability())
    }

    async fn render(&self, renderer: &dyn Renderer, request: &CrawlRequest) -> Result<FetchedPage> {
        let rendered = renderer
            .render(&request.url, self.detection.render_timeout)
            .await
            .map_err(|e| CrawlError::Render {
                url: request.url.clone(),
                message: format!("{:#}", e),
            })?;

        Ok(rendered_page(request, rendered))
    }

    /// Fetch both ways, classify the host and keep the better result
    async fn compare(&self, renderer: &dyn Renderer, request: &CrawlRequest, hostname: &str) -> Result<FetchedPage> {
        self.comparisons.fetch_add(1, Ordering::SeqCst);

        let static_page = self.static_crawler.fetch(request).await?;
        let static_len = static_page.text().chars().count();

        let rendered = match renderer.render(&request.url, self.detection.render_timeout).await {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!("Rendering comparison for {} failed: {:#}", hostname, e);
                return Ok(static_page);
            }
        };
        let browser_len = rendered.text.chars().count();

        let rendering = if self.detection.browser_required(static_len, browser_len) {
            RenderingType::Browser
        } else {
            RenderingType::Static
        };

        info!(
            "Classified {} as {:?} (static text {} chars, rendered text {} chars)",
            hostname, rendering, static_len, browser_len
        );
        self.rendering_types
            .lock()
            .await
            .insert(hostname.to_string(), rendering);

        match rendering {
            RenderingType::Browser => Ok(rendered_page(request, rendered)),
            RenderingType::Static => Ok(static_page),
        }
    }
}

fn rendered_page(request: &CrawlRequest, rendered: RenderedContent) -> FetchedPage {
    let url = if rendered.url.is_empty() {
        request.url.clone()
    } else {
        rendered.url
    };

    FetchedPage {
        url,
        status: 200,
        html: rendered.html,
        rendering: RenderingType::Browser,
        session_id: None,
    }
}

#[async_trait]
impl CrawlerEngine for SmartCrawler {
    async fn handle_request(&self, request: &CrawlRequest) -> Result<FetchedPage> {
        let Some(renderer) = self.renderer.as_deref() else {
            return self.static_crawler.fetch(request).await;
        };

        let hostname = request
            .hostname()
            .ok_or_else(|| CrawlError::InvalidUrl(request.url.clone()))?;

        match self.rendering_type(&hostname).await {
            Some(RenderingType::Browser) => return self.render(renderer, request).await,
            Some(RenderingType::Static) => return self.static_crawler.fetch(request).await,
            None => {}
        }

        if self.should_sample() {
            return self.compare(renderer, request, &hostname).await;
        }

        let page = self.static_crawler.fetch(request).await?;
        if !looks_client_rendered(&page.html, &page.text()) {
            return Ok(page);
        }

        debug!("{} looks client-rendered, retrying in the browser", request.url);
        match self.render(renderer, request).await {
            Ok(rendered) => Ok(rendered),
            Err(e) => {
                warn!("Browser fallback for {} failed: {:#}", request.url, e);
                Ok(page)
            }
        }
    }

    fn name(&self) -> &'static str {
        "smart"
    }
}
