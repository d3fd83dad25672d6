use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use crate::crawler::enqueue::EnqueueStrategy;

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub crawler: CrawlerSettings,
    pub session_pool: SessionPoolSettings,
    pub identity: IdentitySettings,
    pub proxy: ProxySettings,
    pub autoscale: AutoscaleSettings,
    pub monitor: MonitorSettings,
    pub storage: StorageSettings,
    pub browser_service: BrowserServiceSettings,
    pub errors: ErrorSettings,
    pub persistence: PersistenceSettings,
}

/// Crawler-specific settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CrawlerSettings {
    pub max_depth: u32,
    /// Stop after this many handled requests (0 = unlimited)
    pub max_requests_per_crawl: usize,
    pub max_request_retries: u32,
    pub request_timeout_ms: u64,
    pub enqueue_strategy: EnqueueStrategy,
    pub url_patterns: UrlPatterns,
    /// Fraction of requests to unclassified hosts fetched both ways
    pub rendering_type_detection_ratio: f64,
    /// Browser text must exceed static text by this factor...
    pub browser_required_ratio: f64,
    /// ...and by at least this many characters
    pub browser_required_margin: usize,
    pub render_timeout_ms: u64,
}

/// URL pattern settings
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct UrlPatterns {
    /// Glob patterns, or regular expressions when wrapped in slashes (`/.../`)
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SessionPoolSettings {
    pub max_pool_size: usize,
    pub max_error_score: u32,
    pub max_usage_count: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct IdentitySettings {
    pub user_agents: Vec<String>,
    pub browser_profiles: Vec<BrowserProfile>,
    pub fingerprint_cache_size: usize,
}

/// Browser profile a fingerprint is derived from
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BrowserProfile {
    pub name: String,
    pub accept_language: String,
    pub platform: String,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

/// Proxy settings
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ProxySettings {
    pub enabled: bool,
    pub proxy_list: Vec<ProxyConfig>,
}

/// Individual proxy configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProxyConfig {
    pub name: String,
    pub proxy_type: String, // "http", "socks5"
    pub address: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Proxy URL understood by the HTTP client
    pub fn url(&self) -> String {
        let (scheme, default_port) = match self.proxy_type.as_str() {
            "socks5" => ("socks5", 1080),
            _ => ("http", 8080),
        };
        let port = self.port.unwrap_or(default_port);
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                format!("{}://{}:{}@{}:{}", scheme, username, password, self.address, port)
            }
            _ => format!("{}://{}:{}", scheme, self.address, port),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AutoscaleSettings {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub desired_concurrency: usize,
    pub scale_interval_ms: u64,
    pub scale_up_step_ratio: f64,
    pub scale_down_step_ratio: f64,
    /// Idle sleep of the spawn loop
    pub maybe_run_interval_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorSettings {
    pub memory_interval_ms: u64,
    pub max_memory_ratio: f64,
    pub max_snapshot_age_ms: u64,
    pub event_loop_interval_ms: u64,
    pub max_blocked_ms: u64,
    /// Window and overloaded-sample fraction for scale-down decisions
    pub overload_window_ms: u64,
    pub overload_threshold: f64,
    /// Longer window that must be free of overload before scaling up
    pub idle_window_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StorageSettings {
    pub queue: QueueSettings,
    /// Directory where error snapshots are written
    pub snapshot_dir: Option<PathBuf>,
}

/// Queue settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct QueueSettings {
    /// When unset the queue lives in process memory
    pub redis_url: Option<String>,
    pub queue_id: String,
    pub strategy: String, // "bfs", "dfs"
    pub batch_size: usize,
    pub task_ttl: u64, // Time to live for queue keys in seconds
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BrowserServiceSettings {
    pub enabled: bool,
    pub url: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ErrorSettings {
    pub max_snapshots: usize,
    pub show_stack_location: bool,
    pub show_error_code: bool,
    pub show_error_name: bool,
    pub show_full_message: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PersistenceSettings {
    pub enabled: bool,
    pub persist_interval_ms: u64,
    pub ttl_secs: u64,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_requests_per_crawl: 1000,
            max_request_retries: 3,
            request_timeout_ms: 30_000,
            enqueue_strategy: EnqueueStrategy::SameHostname,
            url_patterns: UrlPatterns::default(),
            rendering_type_detection_ratio: 0.1,
            browser_required_ratio: 1.5,
            browser_required_margin: 200,
            render_timeout_ms: 60_000,
        }
    }
}

impl Default for SessionPoolSettings {
    fn default() -> Self {
        Self {
            max_pool_size: 100,
            max_error_score: 3,
            max_usage_count: 50,
        }
    }
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            user_agents: vec![
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0".to_string(),
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_2) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15".to_string(),
            ],
            browser_profiles: vec![
                BrowserProfile {
                    name: "windows".to_string(),
                    accept_language: "en-US,en;q=0.9".to_string(),
                    platform: "Win32".to_string(),
                    extra_headers: HashMap::new(),
                },
                BrowserProfile {
                    name: "macos".to_string(),
                    accept_language: "en-GB,en;q=0.8".to_string(),
                    platform: "MacIntel".to_string(),
                    extra_headers: HashMap::new(),
                },
            ],
            fingerprint_cache_size: 1000,
        }
    }
}

impl Default for AutoscaleSettings {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 200,
            desired_concurrency: 10,
            scale_interval_ms: 10_000,
            scale_up_step_ratio: 0.05,
            scale_down_step_ratio: 0.05,
            maybe_run_interval_ms: 50,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            memory_interval_ms: 1_000,
            max_memory_ratio: 0.7,
            max_snapshot_age_ms: 30_000,
            event_loop_interval_ms: 500,
            max_blocked_ms: 50,
            overload_window_ms: 5_000,
            overload_threshold: 0.6,
            idle_window_ms: 30_000,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            queue_id: "default".to_string(),
            strategy: "bfs".to_string(),
            batch_size: 25,
            task_ttl: 86_400,
        }
    }
}

impl Default for BrowserServiceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://localhost:5000".to_string(),
            timeout_ms: 60_000,
        }
    }
}

impl Default for ErrorSettings {
    fn default() -> Self {
        Self {
            max_snapshots: 50,
            show_stack_location: true,
            show_error_code: true,
            show_error_name: true,
            show_full_message: true,
        }
    }
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            persist_interval_ms: 60_000,
            ttl_secs: 7 * 86_400,
        }
    }
}

impl EngineConfig {
    /// Get the path to the config directory
    pub fn config_dir() -> PathBuf {
        let path = if let Some(proj_dirs) =
            directories::ProjectDirs::from("com", "adaptive-crawler", "adaptive-crawler")
        {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        path
    }

    /// Load the default configuration, writing it out on first use
    pub fn load_default() -> Result<Self> {
        let config_path = Self::config_dir().join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_to_file(&config_path)?;
            Ok(config)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        Ok(config)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
crawler:
  max_depth: 7
  enqueue_strategy: same-domain
session_pool:
  max_error_score: 5
storage:
  queue:
    strategy: dfs
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.crawler.max_depth, 7);
        assert_eq!(config.crawler.enqueue_strategy, EnqueueStrategy::SameDomain);
        assert_eq!(config.crawler.max_request_retries, 3);
        assert_eq!(config.session_pool.max_error_score, 5);
        assert_eq!(config.session_pool.max_pool_size, 100);
        assert_eq!(config.storage.queue.strategy, "dfs");
        assert!(config.storage.queue.redis_url.is_none());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let mut config = EngineConfig::default();
        config.autoscale.max_concurrency = 42;
        config.save_to_file(&path).unwrap();

        let loaded = EngineConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.autoscale.max_concurrency, 42);
        assert_eq!(loaded.identity.user_agents.len(), config.identity.user_agents.len());
    }

    #[test]
    fn test_proxy_url() {
        let proxy = ProxyConfig {
            name: "p1".to_string(),
            proxy_type: "socks5".to_string(),
            address: "10.0.0.1".to_string(),
            port: None,
            username: Some("u".to_string()),
            password: Some("p".to_string()),
        };
        assert_eq!(proxy.url(), "socks5://u:p@10.0.0.1:1080");
    }
}
