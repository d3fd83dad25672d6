use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::config::{ProxyConfig, ProxySettings};

/// Least-recently-used proxy rotation with per-host affinity avoidance
pub struct ProxyRotator {
    proxies: Vec<ProxyConfig>,

    /// Proxy URL -> logical time of last use
    last_used: HashMap<String, u64>,

    /// Hostname -> proxy URL it was last routed through
    last_for_host: HashMap<String, String>,

    /// Proxy URLs removed from rotation
    blocked: HashSet<String>,

    clock: u64,
}

impl ProxyRotator {
    pub fn new(settings: &ProxySettings) -> Self {
        let proxies = if settings.enabled {
            settings.proxy_list.clone()
        } else {
            Vec::new()
        };

        Self {
            proxies,
            last_used: HashMap::new(),
            last_for_host: HashMap::new(),
            blocked: HashSet::new(),
            clock: 0,
        }
    }

    /// Least recently used usable proxy for `hostname`.
    ///
    /// Ties prefer proxies that did not serve this hostname last. Returns
    /// `None` when no proxy is configured or every proxy is blocked.
    pub fn get_proxy(&mut self, hostname: &str) -> Option<String> {
        let last_for_host = self.last_for_host.get(hostname);

        let chosen = self
            .proxies
            .iter()
            .map(ProxyConfig::url)
            .filter(|url| !self.blocked.contains(url))
            .min_by_key(|url| {
                let used_at = self.last_used.get(url).copied();
                let same_host = last_for_host == Some(url);
                // `None` sorts before any `Some`, so never-used proxies win
                (used_at, same_host)
            })?;

        self.clock += 1;
        self.last_used.insert(chosen.clone(), self.clock);
        self.last_for_host.insert(hostname.to_string(), chosen.clone());

        debug!("Routing {} through proxy {}", hostname, redact(&chosen));

        Some(chosen)
    }

    /// Take a proxy out of rotation until `reset_all`
    pub fn mark_blocked(&mut self, proxy_url: &str) {
        if self.blocked.insert(proxy_url.to_string()) {
            warn!("Proxy blocked: {}", redact(proxy_url));
        }
    }

    /// Return every proxy to rotation with a clean usage history.
    ///
    /// Host affinity is kept, so the first pick per host after a reset still
    /// moves away from the proxy that host saw last.
    pub fn reset_all(&mut self) {
        self.blocked.clear();
        self.last_used.clear();
        debug!("Proxy rotation state reset");
    }

    pub fn available_count(&self) -> usize {
        self.proxies
            .iter()
            .filter(|p| !self.blocked.contains(&p.url()))
            .count()
    }

    pub fn is_enabled(&self) -> bool {
        !self.proxies.is_empty()
    }
}

/// Strip credentials before logging
fn redact(proxy_url: &str) -> String {
    match url::Url::parse(proxy_url) {
        Ok(mut parsed) if !parsed.username().is_empty() => {
            let _ = parsed.set_username("");
            let _ = parsed.set_password(None);
            parsed.to_string()
        }
        _ => proxy_url.to_string(),
    }
}
