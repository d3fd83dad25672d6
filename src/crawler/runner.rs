use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::autoscale::{AutoscaledPool, LoadSignals, PoolCallbacks};
use crate::config::{AutoscaleSettings, CrawlerSettings};
use crate::crawler::enqueue::{enqueue_links, EnqueueLinksOptions, SkippedLink};
use crate::crawler::request::CrawlRequest;
use crate::crawler::robots::RobotsTxt;
use crate::crawler::{CrawlerEngine, FetchedPage};
use crate::diagnostics::{ErrorGroup, ErrorTracker, SnapshotSource};
use crate::error::{is_retryable, CrawlError};
use crate::storage::queue::{PersistentRequestQueue, QueueStats};
use crate::storage::state::{shutdown_requested, CrawlPhase, StatePersister};
use crate::utils::metrics::{Metrics, MetricsCollector};

const TOP_ERRORS: usize = 10;

/// User code run on every successfully fetched page
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PageHandler: Send + Sync {
    async fn handle_page(&self, request: &CrawlRequest, page: &FetchedPage) -> Result<()>;
}

/// What happened to the links discovered on one page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOutcome {
    pub accepted: Vec<String>,
    pub duplicates: Vec<String>,
    pub skipped: Vec<SkippedLink>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlSummary {
    pub queue: QueueStats,
    pub metrics: Metrics,
    pub top_errors: Vec<ErrorGroup>,
}

/// Drives one crawl: pulls requests from the queue, fetches them through the
/// engine and feeds discovered links back into the queue
pub struct Crawler {
    settings: CrawlerSettings,
    queue: Arc<PersistentRequestQueue>,
    engine: Arc<dyn CrawlerEngine>,
    tracker: Arc<ErrorTracker>,
    persister: Option<Arc<StatePersister>>,
    handler: Option<Arc<dyn PageHandler>>,
    enqueue_options: EnqueueLinksOptions,
    metrics: MetricsCollector,
    /// Requests claimed against `max_requests_per_crawl`
    claimed: AtomicUsize,
}

impl Crawler {
    pub fn new(
        settings: CrawlerSettings,
        queue: Arc<PersistentRequestQueue>,
        engine: Arc<dyn CrawlerEngine>,
        tracker: Arc<ErrorTracker>,
    ) -> Result<Self> {
        let mut enqueue_options =
            EnqueueLinksOptions::new(settings.enqueue_strategy).with_patterns(&settings.url_patterns)?;
        enqueue_options.max_retries = Some(settings.max_request_retries);

        Ok(Self {
            settings,
            queue,
            engine,
            tracker,
            persister: None,
            handler: None,
            enqueue_options,
            metrics: MetricsCollector::new(),
            claimed: AtomicUsize::new(0),
        })
    }

    pub fn with_persister(mut self, persister: Arc<StatePersister>) -> Self {
        self.persister = Some(persister);
        self
    }

    pub fn with_page_handler(mut self, handler: Arc<dyn PageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Respect `robots` for discovered links, matching groups by `user_agent`
    pub fn with_robots(mut self, robots: Arc<RobotsTxt>, user_agent: &str) -> Self {
        self.enqueue_options.robots = Some(robots);
        self.enqueue_options.user_agent = user_agent.to_string();
        self
    }

    /// Replace the link filtering options wholesale
    pub fn with_enqueue_options(mut self, options: EnqueueLinksOptions) -> Self {
        self.enqueue_options = options;
        self
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn queue(&self) -> &Arc<PersistentRequestQueue> {
        &self.queue
    }

    fn limit_reached(&self) -> bool {
        let limit = self.settings.max_requests_per_crawl;
        limit > 0 && self.claimed.load(Ordering::SeqCst) >= limit
    }

    fn claim(&self) -> bool {
        let limit = self.settings.max_requests_per_crawl;
        self.claimed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (limit == 0 || n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        self.claimed.fetch_sub(1, Ordering::SeqCst);
    }

    /// Enqueue start URLs at depth 0
    pub async fn add_seeds(&self, urls: &[String]) -> Result<usize> {
        let mut requests = Vec::with_capacity(urls.len());
        for url in urls {
            match CrawlRequest::new(url.as_str()) {
                Ok(request) => requests.push(request.with_max_retries(self.settings.max_request_retries)),
                Err(e) => warn!("Ignoring seed: {}", e),
            }
        }

        let infos = self.queue.add_requests(requests).await?;
        let added = infos.iter().filter(|info| !info.was_already_present).count();
        self.record_total(added).await;

        info!("Enqueued {} seed URLs ({} already known)", added, infos.len() - added);
        Ok(added)
    }

    /// Filter `links` found on `page_url` and enqueue the survivors at `depth`
    pub async fn enqueue_discovered(&self, page_url: &str, links: &[String], depth: u32) -> Result<EnqueueOutcome> {
        let skipped = Arc::new(StdMutex::new(Vec::new()));

        let mut options = self.enqueue_options.clone();
        options.depth = depth;
        let user_hook = options.on_skip.take();
        let sink = skipped.clone();
        options.on_skip = Some(Arc::new(move |link: &SkippedLink| {
            if let Some(hook) = &user_hook {
                hook(link);
            }
            if let Ok(mut skipped) = sink.lock() {
                skipped.push(link.clone());
            }
        }));

        let requests = enqueue_links(links, page_url, &options);
        let urls: Vec<String> = requests.iter().map(|r| r.url.clone()).collect();
        let infos = self.queue.add_requests(requests).await?;

        let mut outcome = EnqueueOutcome {
            skipped: skipped.lock().map(|s| s.clone()).unwrap_or_default(),
            ..Default::default()
        };
        for (url, info) in urls.into_iter().zip(infos) {
            if info.was_already_present {
                outcome.duplicates.push(url);
            } else {
                outcome.accepted.push(url);
            }
        }

        self.record_total(outcome.accepted.len()).await;
        debug!(
            "{}: {} links enqueued, {} duplicates, {} skipped",
            page_url,
            outcome.accepted.len(),
            outcome.duplicates.len(),
            outcome.skipped.len()
        );
        Ok(outcome)
    }

    async fn record_total(&self, added: usize) {
        if added == 0 {
            return;
        }
        if let Some(persister) = &self.persister {
            persister.update(|state| state.total_requests += added as u64).await;
        }
    }

    /// Handle one queued request. Returns `false` when nothing could be
    /// claimed, either because the queue is empty or the limit is reached.
    pub async fn process_next(&self) -> Result<bool> {
        if !self.claim() {
            return Ok(false);
        }

        let request = match self.queue.fetch_next_request().await {
            Ok(Some(request)) => request,
            Ok(None) => {
                self.release();
                return Ok(false);
            }
            Err(e) => {
                self.release();
                return Err(e);
            }
        };

        self.process(request).await?;
        Ok(true)
    }

    async fn process(&self, request: CrawlRequest) -> Result<()> {
        let timer = self.metrics.start_timer();

        let page = match self.fetch_and_handle(&request).await {
            Ok(page) => page,
            Err(e) => return self.handle_failure(request, e, timer.end()).await,
        };

        if request.depth < self.settings.max_depth {
            let links = page.links();
            if let Err(e) = self.enqueue_discovered(&page.url, &links, request.depth + 1).await {
                warn!("Enqueueing links from {} failed: {:#}", page.url, e);
            }
        }

        self.queue.mark_completed(&request).await?;
        self.metrics
            .record_request(true, timer.end(), Some(page.status), page.html.len())
            .await;
        if let Some(persister) = &self.persister {
            let url = request.url.clone();
            persister
                .update(|state| {
                    state.completed_requests += 1;
                    state.last_processed_url = Some(url);
                })
                .await;
        }

        debug!("Processed {} via {:?} rendering", request.url, page.rendering);
        Ok(())
    }

    async fn fetch_and_handle(&self, request: &CrawlRequest) -> Result<FetchedPage> {
        let page = self.engine.handle_request(request).await?;
        if let Some(handler) = &self.handler {
            handler.handle_page(request, &page).await?;
        }
        Ok(page)
    }

    async fn handle_failure(&self, request: CrawlRequest, err: anyhow::Error, duration_ms: u64) -> Result<()> {
        let crawl_error = err.downcast_ref::<CrawlError>();
        let source = match crawl_error.and_then(CrawlError::body) {
            Some(body) => SnapshotSource::Html(body),
            None => SnapshotSource::None,
        };
        self.tracker.add_with_snapshot(&err, source).await;

        if request.can_retry() && is_retryable(&err) {
            warn!(
                "Request {} failed (attempt {}/{}), retrying: {:#}",
                request.url,
                request.retry_count + 1,
                request.max_retries + 1,
                err
            );
            self.queue.reclaim_request(&request).await?;
            self.metrics.record_retry(duration_ms).await;
            // retries do not count against the request limit
            self.release();
            return Ok(());
        }

        error!("Request {} failed permanently: {:#}", request.url, err);
        self.queue.mark_failed(&request, &format!("{:#}", err)).await?;

        let status = match crawl_error {
            Some(CrawlError::Http { status, .. }) | Some(CrawlError::Blocked { status, .. }) => Some(*status),
            _ => None,
        };
        self.metrics.record_request(false, duration_ms, status, 0).await;
        if let Some(persister) = &self.persister {
            let url = request.url.clone();
            persister
                .update(|state| {
                    state.failed_requests += 1;
                    state.last_processed_url = Some(url);
                })
                .await;
        }

        Ok(())
    }

    /// Callbacks binding an autoscaled pool to this crawler
    pub fn callbacks(self: &Arc<Self>) -> PoolCallbacks {
        let run = Arc::clone(self);
        let ready = Arc::clone(self);
        let finished = Arc::clone(self);

        PoolCallbacks {
            run_task: Arc::new(move || {
                let crawler = run.clone();
                async move { crawler.process_next().await.map(|_| ()) }.boxed()
            }),
            is_task_ready: Arc::new(move || {
                let crawler = ready.clone();
                async move { crawler.has_ready_task().await }.boxed()
            }),
            is_finished: Arc::new(move || {
                let crawler = finished.clone();
                async move { crawler.is_finished().await }.boxed()
            }),
        }
    }

    async fn has_ready_task(&self) -> Result<bool> {
        if self.limit_reached() {
            return Ok(false);
        }
        Ok(!self.queue.is_empty().await?)
    }

    async fn is_finished(&self) -> Result<bool> {
        if self.limit_reached() {
            info!("Reached the limit of {} requests", self.settings.max_requests_per_crawl);
            return Ok(true);
        }
        self.queue.is_finished().await
    }

    /// Crawl until the queue drains, the request limit is hit or the process
    /// is asked to terminate
    pub async fn run(self: &Arc<Self>, autoscale: &AutoscaleSettings, signals: Arc<dyn LoadSignals>) -> Result<CrawlSummary> {
        info!("Starting crawl of queue {} with the {} engine", self.queue.id(), self.engine.name());

        let pool = Arc::new(AutoscaledPool::new(autoscale, signals, self.callbacks()));

        let mut watcher = None;
        if let Some(persister) = &self.persister {
            persister.update(|state| state.phase = CrawlPhase::Crawling).await;
            persister.start().await;
            persister.register_shutdown_handlers().await;

            let mut shutdown = shutdown_requested();
            let pool = Arc::clone(&pool);
            watcher = Some(tokio::spawn(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        warn!("Shutdown requested, letting running requests finish");
                        pool.stop();
                        break;
                    }
                }
            }));
        }

        let outcome = pool.run().await;

        if let Some(watcher) = watcher {
            watcher.abort();
        }
        if let Some(persister) = &self.persister {
            persister.stop().await;
            persister.update(|state| state.phase = CrawlPhase::Finished).await;
            persister.persist_logged().await;
        }

        outcome?;
        let summary = self.summary().await?;
        info!(
            "Crawl finished: {} completed, {} failed, {} error groups",
            summary.queue.completed,
            summary.queue.failed,
            summary.top_errors.len()
        );
        Ok(summary)
    }

    pub async fn summary(&self) -> Result<CrawlSummary> {
        Ok(CrawlSummary {
            queue: self.queue.get_stats().await?,
            metrics: self.metrics.get_metrics().await,
            top_errors: self.tracker.get_most_popular_errors(TOP_ERRORS).await,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoscale::MockLoadSignals;
    use crate::config::{ErrorSettings, PersistenceSettings};
    use crate::crawler::{MockCrawlerEngine, RenderingType};
    use crate::storage::kv::MemoryKeyValueStore;
    use crate::storage::strategy::BreadthFirst;

    fn page(url: &str, links: &[&str]) -> FetchedPage {
        let anchors: String = links.iter().map(|l| format!("<a href=\"{}\">x</a>", l)).collect();
        FetchedPage {
            url: url.to_string(),
            status: 200,
            html: format!("<html><body>{}</body></html>", anchors),
            rendering: RenderingType::Static,
            session_id: None,
        }
    }

    /// Every page links to two children: /a -> /a/0, /a/1
    fn tree_engine() -> MockCrawlerEngine {
        let mut engine = MockCrawlerEngine::new();
        engine.expect_name().return_const("mock");
        engine.expect_handle_request().returning(|request| {
            let base = request.url.trim_end_matches('/').to_string();
            let children = [format!("{}/0", base), format!("{}/1", base)];
            let links: Vec<&str> = children.iter().map(String::as_str).collect();
            Ok(page(&request.url, &links))
        });
        engine
    }

    fn crawler(settings: CrawlerSettings, engine: MockCrawlerEngine) -> Crawler {
        let queue = Arc::new(PersistentRequestQueue::in_memory("test", Arc::new(BreadthFirst)));
        let tracker = Arc::new(ErrorTracker::new(ErrorSettings::default(), None));
        Crawler::new(settings, queue, Arc::new(engine), tracker).unwrap()
    }

    fn quiet_signals() -> Arc<dyn LoadSignals> {
        let mut signals = MockLoadSignals::new();
        signals.expect_is_overloaded().returning(|| false);
        signals.expect_is_underutilized().returning(|| false);
        Arc::new(signals)
    }

    fn autoscale() -> AutoscaleSettings {
        AutoscaleSettings {
            min_concurrency: 1,
            max_concurrency: 4,
            desired_concurrency: 2,
            scale_interval_ms: 50,
            maybe_run_interval_ms: 5,
            ..AutoscaleSettings::default()
        }
    }

    #[tokio::test]
    async fn test_run_stops_at_max_depth() {
        let settings = CrawlerSettings {
            max_depth: 2,
            max_requests_per_crawl: 0,
            ..CrawlerSettings::default()
        };
        let crawler = Arc::new(crawler(settings, tree_engine()));
        crawler.add_seeds(&["https://example.com/".to_string()]).await.unwrap();

        let summary = crawler.run(&autoscale(), quiet_signals()).await.unwrap();

        // 1 root + 2 children + 4 grandchildren
        assert_eq!(summary.queue.completed, 7);
        assert_eq!(summary.queue.total, 7);
        assert_eq!(summary.queue.failed, 0);
        assert_eq!(summary.metrics.successful_requests, 7);
        assert!(summary.top_errors.is_empty());
    }

    #[tokio::test]
    async fn test_run_honors_request_limit() {
        let settings = CrawlerSettings {
            max_depth: 10,
            max_requests_per_crawl: 5,
            ..CrawlerSettings::default()
        };
        let crawler = Arc::new(crawler(settings, tree_engine()));
        crawler.add_seeds(&["https://example.com/".to_string()]).await.unwrap();

        let summary = crawler.run(&autoscale(), quiet_signals()).await.unwrap();

        assert_eq!(summary.queue.completed, 5);
        assert!(summary.queue.pending > 0);
    }

    #[tokio::test]
    async fn test_retryable_failures_are_retried_then_failed() {
        let mut engine = MockCrawlerEngine::new();
        engine.expect_handle_request().times(3).returning(|request| {
            Err(CrawlError::Http {
                url: request.url.clone(),
                status: 503,
            }
            .into())
        });

        let settings = CrawlerSettings {
            max_request_retries: 2,
            ..CrawlerSettings::default()
        };
        let crawler = crawler(settings, engine);
        crawler.add_seeds(&["https://example.com/flaky".to_string()]).await.unwrap();

        while crawler.process_next().await.unwrap() {}

        let summary = crawler.summary().await.unwrap();
        assert_eq!(summary.queue.failed, 1);
        assert_eq!(summary.queue.completed, 0);
        assert_eq!(summary.metrics.retried_requests, 2);
        assert_eq!(summary.metrics.failed_requests, 1);
        assert_eq!(summary.metrics.status_codes.get(&503), Some(&1));
        assert_eq!(summary.top_errors.len(), 1);
        assert_eq!(summary.top_errors[0].count, 3);
        assert_eq!(summary.top_errors[0].code.as_deref(), Some("HTTP_503"));
    }

    #[tokio::test]
    async fn test_client_errors_fail_without_retry() {
        let mut engine = MockCrawlerEngine::new();
        engine.expect_handle_request().times(1).returning(|request| {
            Err(CrawlError::Http {
                url: request.url.clone(),
                status: 404,
            }
            .into())
        });

        let crawler = crawler(CrawlerSettings::default(), engine);
        crawler.add_seeds(&["https://example.com/missing".to_string()]).await.unwrap();

        assert!(crawler.process_next().await.unwrap());
        assert!(!crawler.process_next().await.unwrap());
        assert_eq!(crawler.summary().await.unwrap().queue.failed, 1);
    }

    #[tokio::test]
    async fn test_page_handler_sees_pages_and_its_errors_are_tracked() {
        let mut handler = MockPageHandler::new();
        handler
            .expect_handle_page()
            .times(2)
            .returning(|_, page| match page.url.ends_with("/bad") {
                true => anyhow::bail!("could not parse product"),
                false => Ok(()),
            });

        let mut engine = MockCrawlerEngine::new();
        engine.expect_handle_request().returning(|request| Ok(page(&request.url, &[])));

        let settings = CrawlerSettings {
            max_request_retries: 0,
            ..CrawlerSettings::default()
        };
        let crawler = crawler(settings, engine).with_page_handler(Arc::new(handler));
        crawler
            .add_seeds(&["https://example.com/good".to_string(), "https://example.com/bad".to_string()])
            .await
            .unwrap();

        while crawler.process_next().await.unwrap() {}

        let summary = crawler.summary().await.unwrap();
        assert_eq!(summary.queue.completed, 1);
        assert_eq!(summary.queue.failed, 1);
        assert_eq!(summary.top_errors[0].example_message, "could not parse product");
    }

    #[tokio::test]
    async fn test_enqueue_outcome_and_state_counters() {
        let mut engine = MockCrawlerEngine::new();
        engine.expect_handle_request().returning(|request| {
            Ok(page(&request.url, &["/a", "/b", "https://other.org/", "/a"]))
        });

        let store = Arc::new(MemoryKeyValueStore::new());
        let persister = Arc::new(StatePersister::new(store, PersistenceSettings::default(), "test", None));
        let crawler = crawler(CrawlerSettings::default(), engine).with_persister(persister.clone());

        assert_eq!(crawler.add_seeds(&["https://example.com/".to_string()]).await.unwrap(), 1);

        let outcome = crawler
            .enqueue_discovered("https://example.com/", &page("https://example.com/", &[]).links(), 1)
            .await
            .unwrap();
        assert!(outcome.accepted.is_empty());

        let links: Vec<String> = ["/a", "/b", "https://other.org/", "/a"].iter().map(|s| s.to_string()).collect();
        let outcome = crawler.enqueue_discovered("https://example.com/", &links, 1).await.unwrap();
        assert_eq!(outcome.accepted, vec!["https://example.com/a", "https://example.com/b"]);
        assert_eq!(outcome.duplicates, vec!["https://example.com/a"]);
        assert_eq!(outcome.skipped.len(), 1);

        assert!(crawler.process_next().await.unwrap());
        let state = persister.snapshot().await;
        assert_eq!(state.total_requests, 3);
        assert_eq!(state.completed_requests, 1);
        assert_eq!(state.last_processed_url.as_deref(), Some("https://example.com/"));
    }
}
