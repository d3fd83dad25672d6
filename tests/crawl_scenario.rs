use std::sync::{Arc, Mutex};

use adaptive_crawler::config::{CrawlerSettings, ErrorSettings};
use adaptive_crawler::crawler::{
    enqueue_links, CrawlRequest, Crawler, CrawlerEngine, EnqueueLinksOptions, EnqueueStrategy, FetchedPage,
    RenderingType, SkipReason, SkippedLink,
};
use adaptive_crawler::diagnostics::ErrorTracker;
use adaptive_crawler::storage::strategy::BreadthFirst;
use adaptive_crawler::storage::PersistentRequestQueue;
use anyhow::Result;
use async_trait::async_trait;

const SEED: &str = "https://example.com/";

fn discovered() -> Vec<String> {
    ["https://example.com/a", "https://other.com/b", "https://example.com/a"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[tokio::test]
async fn seed_and_discovered_links_are_filtered_and_deduplicated() {
    let queue = PersistentRequestQueue::in_memory("scenario", Arc::new(BreadthFirst));

    let skipped = Arc::new(Mutex::new(Vec::<SkippedLink>::new()));
    let sink = skipped.clone();
    let mut options = EnqueueLinksOptions::new(EnqueueStrategy::SameHostname);
    options.depth = 1;
    options.on_skip = Some(Arc::new(move |link: &SkippedLink| sink.lock().unwrap().push(link.clone())));

    let seed = queue.add_request(CrawlRequest::new(SEED).unwrap()).await.unwrap();
    assert!(!seed.was_already_present);

    let requests = enqueue_links(&discovered(), SEED, &options);
    assert_eq!(requests.len(), 2);

    let infos = queue.add_requests(requests).await.unwrap();
    let accepted = infos.iter().filter(|info| !info.was_already_present).count();
    let duplicates = infos.iter().filter(|info| info.was_already_present).count();

    // `/a` joins the seed `/`
    assert_eq!(accepted, 1);
    assert_eq!(duplicates, 1);

    let skipped = skipped.lock().unwrap();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].reason, SkipReason::Strategy);
    assert_eq!(skipped[0].url, "https://other.com/b");

    let stats = queue.get_stats().await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.pending, 2);
}

/// Serves the seed page linking to the scenario's links; every other page is empty
struct ScenarioSite;

#[async_trait]
impl CrawlerEngine for ScenarioSite {
    async fn handle_request(&self, request: &CrawlRequest) -> Result<FetchedPage> {
        let html = if request.url == SEED {
            discovered()
                .iter()
                .map(|href| format!("<a href=\"{}\">link</a>", href))
                .collect::<String>()
        } else {
            "<p>leaf</p>".to_string()
        };

        Ok(FetchedPage {
            url: request.url.clone(),
            status: 200,
            html,
            rendering: RenderingType::Static,
            session_id: None,
        })
    }

    fn name(&self) -> &'static str {
        "scenario"
    }
}

#[tokio::test]
async fn crawler_visits_each_in_scope_page_once() {
    let queue = Arc::new(PersistentRequestQueue::in_memory("scenario-run", Arc::new(BreadthFirst)));
    let tracker = Arc::new(ErrorTracker::new(ErrorSettings::default(), None));
    let settings = CrawlerSettings {
        enqueue_strategy: EnqueueStrategy::SameHostname,
        ..CrawlerSettings::default()
    };
    let crawler = Crawler::new(settings, queue, Arc::new(ScenarioSite), tracker).unwrap();

    assert_eq!(crawler.add_seeds(&[SEED.to_string()]).await.unwrap(), 1);
    while crawler.process_next().await.unwrap() {}

    let summary = crawler.summary().await.unwrap();
    assert_eq!(summary.queue.completed, 2);
    assert_eq!(summary.queue.total, 2);
    assert_eq!(summary.queue.failed, 0);
    assert!(summary.top_errors.is_empty());
}
