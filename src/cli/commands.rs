use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::autoscale::{ProcMemorySampler, ResourceMonitor, Snapshotter};
use crate::browser::remote::{RemoteBrowserService, Renderer};
use crate::cli::EngineKind;
use crate::config::EngineConfig;
use crate::crawler::http::{HttpFetcher, ReqwestFetcher};
use crate::crawler::smart::RenderingDetection;
use crate::crawler::{CrawlSummary, Crawler, CrawlerEngine, SmartCrawler, StaticCrawler};
use crate::diagnostics::{ErrorSnapshotter, ErrorTracker};
use crate::session::SessionPool;
use crate::storage::kv::{KeyValueStore, MemoryKeyValueStore, RedisKeyValueStore};
use crate::storage::object::FileObjectStore;
use crate::storage::queue::PersistentRequestQueue;
use crate::storage::state::StatePersister;

/// Command line values that take precedence over the configuration file
#[derive(Debug, Clone, Default)]
pub struct CrawlOverrides {
    pub strategy: Option<String>,
    pub depth: Option<u32>,
    pub limit: Option<usize>,
}

impl CrawlOverrides {
    pub fn apply(&self, config: &mut EngineConfig) {
        if let Some(strategy) = &self.strategy {
            config.storage.queue.strategy = strategy.clone();
        }
        if let Some(depth) = self.depth {
            config.crawler.max_depth = depth;
        }
        if let Some(limit) = self.limit {
            config.crawler.max_requests_per_crawl = limit;
        }
    }
}

pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load_from_file(path),
        None => EngineConfig::load_default(),
    }
}

fn default_snapshot_dir() -> PathBuf {
    match directories::ProjectDirs::from("com", "adaptive-crawler", "adaptive-crawler") {
        Some(dirs) => dirs.data_dir().join("snapshots"),
        None => PathBuf::from("./snapshots"),
    }
}

/// Build the fetch engine described by `config`
pub fn build_engine(config: &EngineConfig, kind: EngineKind) -> Result<Arc<dyn CrawlerEngine>> {
    let sessions = Arc::new(SessionPool::new(
        config.session_pool.clone(),
        &config.identity,
        &config.proxy,
    )?);
    let fetcher: Arc<dyn HttpFetcher> = Arc::new(ReqwestFetcher::new());
    let static_crawler = StaticCrawler::new(
        sessions,
        fetcher,
        Duration::from_millis(config.crawler.request_timeout_ms),
    );

    let engine: Arc<dyn CrawlerEngine> = match kind {
        EngineKind::Static => Arc::new(static_crawler),
        EngineKind::Smart => {
            let renderer: Option<Arc<dyn Renderer>> = if config.browser_service.enabled {
                Some(Arc::new(RemoteBrowserService::new(&config.browser_service)?))
            } else {
                None
            };
            Arc::new(SmartCrawler::new(
                static_crawler,
                renderer,
                RenderingDetection::from_settings(&config.crawler),
            ))
        }
    };

    Ok(engine)
}

/// Redis when configured and reachable, process memory otherwise
async fn open_state_store(config: &EngineConfig) -> Arc<dyn KeyValueStore> {
    if let Some(redis_url) = &config.storage.queue.redis_url {
        match RedisKeyValueStore::connect(redis_url).await {
            Ok(store) => return Arc::new(store),
            Err(e) => warn!("State store unavailable ({:#}), keeping state in memory", e),
        }
    }
    Arc::new(MemoryKeyValueStore::new())
}

/// Persister for the configured queue, picking up any checkpoint left by an earlier run
async fn resume_persister(
    config: &EngineConfig,
    store: Arc<dyn KeyValueStore>,
    queue: Arc<PersistentRequestQueue>,
) -> Result<StatePersister> {
    let queue_id = &config.storage.queue.queue_id;
    let persister = StatePersister::new(store.clone(), config.persistence.clone(), queue_id, Some(queue));

    match StatePersister::restore(store.as_ref(), queue_id).await? {
        Some(restored) => {
            info!(
                "Resuming queue {}: {} completed, {} failed ({:?})",
                queue_id, restored.state.completed_requests, restored.state.failed_requests, restored.state.phase
            );
            Ok(persister.with_state(restored.state))
        }
        None => Ok(persister),
    }
}

/// Crawl `urls` with everything `config` describes and wait for the result
pub async fn run_crawl(config: &EngineConfig, urls: &[String], kind: EngineKind) -> Result<CrawlSummary> {
    let queue = Arc::new(PersistentRequestQueue::open(&config.storage.queue).await?);
    let engine = build_engine(config, kind)?;

    let snapshot_dir = config.storage.snapshot_dir.clone().unwrap_or_else(default_snapshot_dir);
    let snapshotter = Arc::new(ErrorSnapshotter::new(
        Arc::new(FileObjectStore::new(snapshot_dir)),
        config.errors.max_snapshots,
    ));
    let tracker = Arc::new(ErrorTracker::new(config.errors.clone(), Some(snapshotter)));

    let mut crawler = Crawler::new(config.crawler.clone(), queue.clone(), engine, tracker)?;

    if config.persistence.enabled {
        let store = open_state_store(config).await;
        let persister = resume_persister(config, store, queue.clone()).await?;
        crawler = crawler.with_persister(Arc::new(persister));
    }

    crawler.add_seeds(urls).await?;

    let memory = Arc::new(ResourceMonitor::new(config.monitor.clone(), Arc::new(ProcMemorySampler)));
    let load = Arc::new(Snapshotter::new(config.monitor.clone(), memory));
    load.start().await;

    let crawler = Arc::new(crawler);
    let summary = crawler.run(&config.autoscale, load.clone()).await;

    load.stop().await;
    summary
}

pub async fn crawl(url: String, config_path: Option<PathBuf>, kind: EngineKind, overrides: CrawlOverrides) -> Result<()> {
    let mut config = load_config(config_path.as_deref())?;
    overrides.apply(&mut config);

    let summary = run_crawl(&config, &[url], kind).await?;
    print_summary(&summary);

    Ok(())
}

fn print_summary(summary: &CrawlSummary) {
    let queue = &summary.queue;
    println!("Requests: {} completed, {} failed, {} pending", queue.completed, queue.failed, queue.pending);
    println!(
        "Retries: {}, downloaded: {} bytes, peak: {:.1} req/s",
        summary.metrics.retried_requests, summary.metrics.bytes_downloaded, summary.metrics.peak_rps
    );

    if !summary.top_errors.is_empty() {
        println!("Top errors:");
        for group in &summary.top_errors {
            println!("  {:>5}x {}", group.count, group.signature);
            if let Some(html_url) = &group.html_url {
                println!("         snapshot: {}", html_url);
            }
        }
    }
}

pub async fn status(queue_id: String, config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path.as_deref())?;
    if config.storage.queue.redis_url.is_none() {
        warn!("No Redis configured; state only survives inside the crawling process");
    }

    let store = open_state_store(&config).await;
    match StatePersister::restore(store.as_ref(), &queue_id).await? {
        Some(restored) => {
            println!("{}", serde_json::to_string_pretty(&restored.state)?);
            if let Some(queue_state) = restored.queue_state {
                println!("Queue:");
                println!("{}", serde_json::to_string_pretty(&queue_state)?);
            }
        }
        None => println!("No persisted state for queue {}", queue_id),
    }

    Ok(())
}

pub async fn init_config() -> Result<()> {
    let path = EngineConfig::config_dir().join("default.yaml");
    if path.exists() {
        println!("Configuration already exists at {}", path.display());
        return Ok(());
    }

    EngineConfig::default()
        .save_to_file(&path)
        .context("Failed to write default configuration")?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

pub async fn show_config() -> Result<()> {
    let config = EngineConfig::load_default()?;
    println!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}
