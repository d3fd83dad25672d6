pub mod pool;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use pool::SessionPool;

/// A reusable request identity with health tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,

    /// Hostname the identity was created for
    pub hostname: Option<String>,

    pub cookies: HashMap<String, String>,
    pub user_agent: String,
    pub proxy: Option<String>,
    pub fingerprint_id: String,

    /// Fingerprint-derived request headers
    pub headers: HashMap<String, String>,

    pub error_score: u32,
    pub usage_count: u32,
    pub created_at: DateTime<Utc>,

    max_error_score: u32,
    max_usage_count: u32,
}

impl Session {
    pub(crate) fn new(
        hostname: Option<String>,
        user_agent: String,
        proxy: Option<String>,
        fingerprint_id: String,
        headers: HashMap<String, String>,
        max_error_score: u32,
        max_usage_count: u32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            hostname,
            cookies: HashMap::new(),
            user_agent,
            proxy,
            fingerprint_id,
            headers,
            error_score: 0,
            usage_count: 0,
            created_at: Utc::now(),
            max_error_score,
            max_usage_count,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.error_score < self.max_error_score && self.usage_count < self.max_usage_count
    }

    /// Eviction rank; the highest value is evicted first
    pub(crate) fn badness(&self) -> u64 {
        self.error_score as u64 * 100 + self.usage_count as u64
    }

    /// `Cookie` header value, if the session holds cookies
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }

        let mut pairs: Vec<String> = self
            .cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        pairs.sort();

        Some(pairs.join("; "))
    }

    /// Store cookies from `Set-Cookie` header values
    pub(crate) fn set_cookies<'a>(&mut self, set_cookie: impl IntoIterator<Item = &'a str>) {
        for header in set_cookie {
            let pair = header.split(';').next().unwrap_or("");
            if let Some((name, value)) = pair.split_once('=') {
                let name = name.trim();
                if !name.is_empty() {
                    self.cookies.insert(name.to_string(), value.trim().to_string());
                }
            }
        }
    }
}
