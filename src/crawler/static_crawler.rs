use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::crawler::http::{FetchOptions, HttpFetcher};
use crate::crawler::request::CrawlRequest;
use crate::crawler::{CrawlerEngine, FetchedPage, RenderingType};
use crate::error::CrawlError;
use crate::session::SessionPool;

/// Plain HTTP crawler with session-bound identities
pub struct StaticCrawler {
    sessions: Arc<SessionPool>,
    fetcher: Arc<dyn HttpFetcher>,
    timeout: Duration,
}

impl StaticCrawler {
    pub fn new(sessions: Arc<SessionPool>, fetcher: Arc<dyn HttpFetcher>, timeout: Duration) -> Self {
        Self {
            sessions,
            fetcher,
            timeout,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionPool> {
        &self.sessions
    }

    /// Fetch `request` with a session bound to its hostname.
    ///
    /// 403 and 429 retire the session and fail with `CrawlError::Blocked`
    /// so the retry gets a fresh identity.
    pub async fn fetch(&self, request: &CrawlRequest) -> Result<FetchedPage> {
        let hostname = request
            .hostname()
            .ok_or_else(|| CrawlError::InvalidUrl(request.url.clone()))?;
        let session = self.sessions.get_session(Some(&hostname)).await?;

        // Request headers override the fingerprint's
        let mut headers = session.headers.clone();
        headers.extend(request.headers.clone());
        if let Some(cookie) = session.cookie_header() {
            headers.insert("Cookie".to_string(), cookie);
        }

        let options = FetchOptions {
            headers,
            timeout: self.timeout,
            proxy_url: session.proxy.clone(),
        };

        let response = match self.fetcher.get(&request.url, &options).await {
            Ok(response) => response,
            Err(e) => {
                self.sessions.mark_bad(&session.id).await;
                return Err(e);
            }
        };

        match response.status {
            403 | 429 => {
                warn!(
                    "Blocked by {} (HTTP {}), retiring session {}",
                    hostname, response.status, session.id
                );
                self.sessions.retire(&session.id).await;
                Err(CrawlError::Blocked {
                    url: request.url.clone(),
                    status: response.status,
                    body: Some(response.body),
                }
                .into())
            }
            status if status >= 500 => {
                self.sessions.mark_bad(&session.id).await;
                Err(CrawlError::Http {
                    url: request.url.clone(),
                    status,
                }
                .into())
            }
            status if status >= 400 => {
                // The site answered normally; the identity is fine
                self.sessions.mark_good(&session.id).await;
                Err(CrawlError::Http {
                    url: request.url.clone(),
                    status,
                }
                .into())
            }
            status => {
                self.sessions.update_cookies(&session.id, &response.set_cookies).await;
                self.sessions.mark_good(&session.id).await;
                debug!("Fetched {} statically (HTTP {})", request.url, status);

                Ok(FetchedPage {
                    url: response.url,
                    status,
                    html: response.body,
                    rendering: RenderingType::Static,
                    session_id: Some(session.id),
                })
            }
        }
    }
}

#[async_trait]
impl CrawlerEngine for StaticCrawler {
    async fn handle_request(&self, request: &CrawlRequest) -> Result<FetchedPage> {
        self.fetch(request).await
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IdentitySettings, ProxySettings, SessionPoolSettings};
    use crate::crawler::http::{HttpResponse, MockHttpFetcher};

    fn pool() -> Arc<SessionPool> {
        pool_retiring_after(3)
    }

    fn pool_retiring_after(max_error_score: u32) -> Arc<SessionPool> {
        Arc::new(
            SessionPool::new(
                SessionPoolSettings {
                    max_pool_size: 1,
                    max_error_score,
                    max_usage_count: 50,
                },
                &IdentitySettings::default(),
                &ProxySettings::default(),
            )
            .unwrap(),
        )
    }

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            url: "https://example.com/".to_string(),
            status,
            body: body.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_success_keeps_cookies_and_identity_headers() {
        let mut fetcher = MockHttpFetcher::new();
        fetcher.expect_get().times(1).returning(|_, options| {
            assert!(options.headers.contains_key("User-Agent"));
            assert_eq!(options.headers.get("X-Custom").map(String::as_str), Some("1"));
            assert!(!options.headers.contains_key("Cookie"));
            let mut ok = response(200, "<html><body>ok</body></html>");
            ok.set_cookies = vec!["sid=abc; Path=/".to_string()];
            Ok(ok)
        });

        let sessions = pool();
        let crawler = StaticCrawler::new(sessions.clone(), Arc::new(fetcher), Duration::from_secs(5));
        let mut request = CrawlRequest::new("https://example.com/").unwrap();
        request.headers.insert("X-Custom".to_string(), "1".to_string());

        let page = crawler.handle_request(&request).await.unwrap();
        assert_eq!(page.rendering, RenderingType::Static);
        assert_eq!(page.text(), "ok");

        let session = sessions.get(page.session_id.as_deref().unwrap()).await.unwrap();
        assert_eq!(session.error_score, 0);
        assert_eq!(session.usage_count, 1);
        assert_eq!(session.cookie_header().as_deref(), Some("sid=abc"));
    }

    #[tokio::test]
    async fn test_blocked_response_retires_session() {
        let mut fetcher = MockHttpFetcher::new();
        fetcher
            .expect_get()
            .times(1)
            .returning(|_, _| Ok(response(429, "<html>slow down</html>")));

        let sessions = pool();
        let crawler = StaticCrawler::new(sessions.clone(), Arc::new(fetcher), Duration::from_secs(5));
        let err = crawler
            .handle_request(&CrawlRequest::new("https://example.com/").unwrap())
            .await
            .unwrap_err();

        let crawl_error = err.downcast_ref::<CrawlError>().unwrap();
        assert!(crawl_error.is_blocked());
        assert_eq!(crawl_error.body(), Some("<html>slow down</html>"));
        assert!(sessions.is_empty().await);
    }

    #[tokio::test]
    async fn test_server_errors_mark_session_bad() {
        let mut fetcher = MockHttpFetcher::new();
        fetcher.expect_get().returning(|_, _| Ok(response(503, "")));

        let sessions = pool_retiring_after(1);
        let crawler = StaticCrawler::new(sessions.clone(), Arc::new(fetcher), Duration::from_secs(5));
        let request = CrawlRequest::new("https://example.com/").unwrap();

        let first = crawler.handle_request(&request).await.unwrap_err();
        assert!(crate::error::is_retryable(&first));

        // one bad mark is enough to retire it
        assert!(sessions.is_empty().await);
    }

    #[tokio::test]
    async fn test_transport_failure_is_propagated() {
        let mut fetcher = MockHttpFetcher::new();
        fetcher.expect_get().returning(|url, _| {
            Err(CrawlError::Timeout {
                url: url.to_string(),
                timeout_ms: 5,
            }
            .into())
        });

        let crawler = StaticCrawler::new(pool(), Arc::new(fetcher), Duration::from_millis(5));
        let err = crawler
            .handle_request(&CrawlRequest::new("https://example.com/").unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err.downcast_ref::<CrawlError>(), Some(CrawlError::Timeout { .. })));
    }
}
