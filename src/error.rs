use thiserror::Error;

/// Failure taxonomy for a single request fetch
#[derive(Debug, Error)]
pub enum CrawlError {
    /// The per-request deadline elapsed before the fetch resolved
    #[error("Request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    /// The fetch was cancelled before completing
    #[error("Request to {url} was aborted")]
    Aborted { url: String },

    /// Connection level failure (DNS, reset, TLS...)
    #[error("Network error while fetching {url}: {message}")]
    Network { url: String, message: String },

    /// Anti-bot detection (HTTP 403 / 429)
    #[error("Blocked by {url} with HTTP status {status}")]
    Blocked {
        url: String,
        status: u16,
        body: Option<String>,
    },

    /// Any other non-success HTTP status
    #[error("HTTP status {status} received from {url}")]
    Http { url: String, status: u16 },

    /// The browser rendering collaborator failed
    #[error("Browser rendering failed for {url}: {message}")]
    Render { url: String, message: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("No usable session available")]
    NoSession,
}

impl CrawlError {
    /// Short type name used when grouping errors
    pub fn name(&self) -> &'static str {
        match self {
            CrawlError::Timeout { .. } => "TimeoutError",
            CrawlError::Aborted { .. } => "AbortError",
            CrawlError::Network { .. } => "NetworkError",
            CrawlError::Blocked { .. } => "BlockedError",
            CrawlError::Http { .. } => "HttpError",
            CrawlError::Render { .. } => "RenderError",
            CrawlError::InvalidUrl(_) => "InvalidUrlError",
            CrawlError::NoSession => "SessionError",
        }
    }

    /// Machine readable code, when the failure carries one
    pub fn code(&self) -> Option<String> {
        match self {
            CrawlError::Timeout { .. } => Some("ETIMEDOUT".to_string()),
            CrawlError::Aborted { .. } => Some("ABORT_ERR".to_string()),
            CrawlError::Blocked { status, .. } | CrawlError::Http { status, .. } => {
                Some(format!("HTTP_{}", status))
            }
            _ => None,
        }
    }

    /// Whether the request should be requeued for another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            CrawlError::Timeout { .. }
            | CrawlError::Aborted { .. }
            | CrawlError::Network { .. }
            | CrawlError::Blocked { .. }
            | CrawlError::Render { .. }
            | CrawlError::NoSession => true,
            CrawlError::Http { status, .. } => *status >= 500,
            CrawlError::InvalidUrl(_) => false,
        }
    }

    /// URL the failure happened on
    pub fn url(&self) -> Option<&str> {
        match self {
            CrawlError::Timeout { url, .. }
            | CrawlError::Aborted { url }
            | CrawlError::Network { url, .. }
            | CrawlError::Blocked { url, .. }
            | CrawlError::Http { url, .. }
            | CrawlError::Render { url, .. } => Some(url),
            CrawlError::InvalidUrl(url) => Some(url),
            CrawlError::NoSession => None,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, CrawlError::Blocked { .. })
    }

    /// Response body captured with the failure, used for HTML snapshots
    pub fn body(&self) -> Option<&str> {
        match self {
            CrawlError::Blocked { body, .. } => body.as_deref(),
            _ => None,
        }
    }
}

/// Whether an arbitrary crawl failure deserves another attempt.
///
/// Errors that are not part of the fetch taxonomy (handler failures, parse
/// errors...) are treated as transient.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<CrawlError>()
        .map(CrawlError::is_retryable)
        .unwrap_or(true)
}
