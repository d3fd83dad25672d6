use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, SET_COOKIE};
use reqwest::{redirect, Client};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::CrawlError;

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub headers: HashMap<String, String>,
    pub timeout: Duration,
    pub proxy_url: Option<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            headers: HashMap::new(),
            timeout: Duration::from_secs(30),
            proxy_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpResponse {
    /// Final URL after redirects
    pub url: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    /// Raw `Set-Cookie` header values
    pub set_cookies: Vec<String>,
    pub body: String,
}

/// Static HTTP fetch collaborator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// Fetch `url`. Timeouts surface as `CrawlError::Timeout`, transport
    /// failures as `CrawlError::Network`; any status code is a successful fetch.
    async fn get(&self, url: &str, options: &FetchOptions) -> Result<HttpResponse>;
}

/// `HttpFetcher` on top of reqwest, keeping one client per proxy
pub struct ReqwestFetcher {
    clients: Mutex<HashMap<Option<String>, Client>>,
}

impl ReqwestFetcher {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client_for(&self, proxy_url: Option<&str>) -> Result<Client> {
        let key = proxy_url.map(str::to_string);
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder().redirect(redirect::Policy::limited(10));
        if let Some(proxy_url) = proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url).context("Invalid proxy URL")?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().context("Failed to create HTTP client")?;

        clients.insert(key, client.clone());
        Ok(client)
    }
}

impl Default for ReqwestFetcher {
    fn default() -> Self {
        Self::new()
    }
}

fn header_map(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        // Content decoding is negotiated by the client itself
        if name.eq_ignore_ascii_case("accept-encoding") {
            continue;
        }
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => warn!("Dropping invalid header {}", name),
        }
    }
    map
}

fn transport_error(url: &str, timeout: Duration, err: reqwest::Error) -> CrawlError {
    if err.is_timeout() {
        CrawlError::Timeout {
            url: url.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    } else {
        CrawlError::Network {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn get(&self, url: &str, options: &FetchOptions) -> Result<HttpResponse> {
        let client = self.client_for(options.proxy_url.as_deref()).await?;

        let fetch = async {
            let response = client
                .get(url)
                .headers(header_map(&options.headers))
                .send()
                .await
                .map_err(|e| transport_error(url, options.timeout, e))?;

            let status = response.status().as_u16();
            let final_url = response.url().to_string();
            let set_cookies = response
                .headers()
                .get_all(SET_COOKIE)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .map(str::to_string)
                .collect();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
                .collect();

            let body = response
                .text()
                .await
                .map_err(|e| transport_error(url, options.timeout, e))?;

            Ok::<_, CrawlError>(HttpResponse {
                url: final_url,
                status,
                headers,
                set_cookies,
                body,
            })
        };

        let response = match tokio::time::timeout(options.timeout, fetch).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CrawlError::Timeout {
                    url: url.to_string(),
                    timeout_ms: options.timeout.as_millis() as u64,
                }
                .into())
            }
        };

        debug!("GET {} -> {} ({} bytes)", url, response.status, response.body.len());
        Ok(response)
    }
}
