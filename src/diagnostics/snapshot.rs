use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::browser::page::PageHandle;
use crate::storage::object::ObjectStore;

const SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(2);

/// Where a failing page can be captured from
pub enum SnapshotSource<'a> {
    /// Live browser page such as a `thirtyfour::WebDriver`: screenshot and HTML.
    /// The built-in engines only have response bodies and never pass this.
    Page(&'a dyn PageHandle),
    /// Response body only
    Html(&'a str),
    None,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub screenshot_url: Option<String>,
    pub html_url: Option<String>,
}

/// Captures diagnostic artifacts for new error groups, up to a fixed budget
pub struct ErrorSnapshotter {
    store: Arc<dyn ObjectStore>,
    max_snapshots: usize,
    taken: AtomicUsize,
}

impl ErrorSnapshotter {
    pub fn new(store: Arc<dyn ObjectStore>, max_snapshots: usize) -> Self {
        Self {
            store,
            max_snapshots,
            taken: AtomicUsize::new(0),
        }
    }

    pub fn taken(&self) -> usize {
        self.taken.load(Ordering::SeqCst)
    }

    fn reserve(&self) -> bool {
        self.taken
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < self.max_snapshots).then_some(n + 1))
            .is_ok()
    }

    /// Capture `source` for the error group `signature`.
    ///
    /// Returns `None` once the budget is spent. Capture and upload failures
    /// are logged and leave the corresponding URL empty.
    pub async fn capture(&self, signature: &str, source: SnapshotSource<'_>) -> Option<Snapshot> {
        if matches!(source, SnapshotSource::None) || !self.reserve() {
            return None;
        }

        let key = snapshot_key(signature);
        let mut snapshot = Snapshot::default();

        match source {
            SnapshotSource::Page(page) => {
                match tokio::time::timeout(SCREENSHOT_TIMEOUT, page.screenshot()).await {
                    Ok(Ok(png)) => {
                        snapshot.screenshot_url = self.upload(format!("{}.png", key), png, "image/png").await;
                    }
                    Ok(Err(e)) => warn!("Screenshot for error snapshot failed: {:#}", e),
                    Err(_) => warn!("Screenshot for error snapshot timed out"),
                }

                match page.content().await {
                    Ok(html) => {
                        snapshot.html_url = self.upload(format!("{}.html", key), html.into_bytes(), "text/html").await;
                    }
                    Err(e) => warn!("HTML capture for error snapshot failed: {:#}", e),
                }
            }
            SnapshotSource::Html(html) => {
                snapshot.html_url = self
                    .upload(format!("{}.html", key), html.as_bytes().to_vec(), "text/html")
                    .await;
            }
            SnapshotSource::None => {}
        }

        debug!("Captured error snapshot {}", key);
        Some(snapshot)
    }

    async fn upload(&self, key: String, body: Vec<u8>, content_type: &str) -> Option<String> {
        match self.store.put(&key, body, content_type).await {
            Ok(url) => Some(url),
            Err(e) => {
                warn!("Uploading error snapshot {} failed: {:#}", key, e);
                None
            }
        }
    }
}

fn snapshot_key(signature: &str) -> String {
    let slug: String = signature
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let slug: String = slug.chars().take(60).collect();
    let id = Uuid::new_v4().simple().to_string();

    format!("error-snapshots/{}-{}", slug, &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::page::MockPageHandle;
    use crate::storage::object::FileObjectStore;
    use anyhow::Result;
    use async_trait::async_trait;

    struct FailingStore;

    #[async_trait]
    impl ObjectStore for FailingStore {
        async fn put(&self, _key: &str, _body: Vec<u8>, _content_type: &str) -> Result<String> {
            anyhow::bail!("bucket unavailable")
        }
    }

    #[tokio::test]
    async fn test_budget_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let snapshotter = ErrorSnapshotter::new(Arc::new(FileObjectStore::new(dir.path())), 2);

        assert!(snapshotter.capture("a", SnapshotSource::Html("<p>a</p>")).await.is_some());
        assert!(snapshotter.capture("b", SnapshotSource::Html("<p>b</p>")).await.is_some());
        assert!(snapshotter.capture("c", SnapshotSource::Html("<p>c</p>")).await.is_none());
        assert_eq!(snapshotter.taken(), 2);
    }

    #[tokio::test]
    async fn test_page_capture() {
        let dir = tempfile::tempdir().unwrap();
        let snapshotter = ErrorSnapshotter::new(Arc::new(FileObjectStore::new(dir.path())), 5);

        let mut page = MockPageHandle::new();
        page.expect_screenshot().returning(|| Ok(vec![0x89, 0x50, 0x4e, 0x47]));
        page.expect_content().returning(|| Ok("<html>broken</html>".to_string()));

        let snapshot = snapshotter
            .capture("TimeoutError | Timeout after <N>ms", SnapshotSource::Page(&page))
            .await
            .unwrap();

        assert!(snapshot.screenshot_url.unwrap().ends_with(".png"));
        let html_url = snapshot.html_url.unwrap();
        assert!(html_url.contains("timeouterror-timeout-after-n-ms"));
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let snapshotter = ErrorSnapshotter::new(Arc::new(FailingStore), 5);

        let mut page = MockPageHandle::new();
        page.expect_screenshot().returning(|| anyhow::bail!("browser crashed"));
        page.expect_content().returning(|| Ok("<html></html>".to_string()));

        let snapshot = snapshotter.capture("sig", SnapshotSource::Page(&page)).await.unwrap();
        assert_eq!(snapshot, Snapshot::default());
    }

    #[tokio::test]
    async fn test_nothing_to_capture_does_not_use_budget() {
        let snapshotter = ErrorSnapshotter::new(Arc::new(FailingStore), 1);
        assert!(snapshotter.capture("sig", SnapshotSource::None).await.is_none());
        assert_eq!(snapshotter.taken(), 0);
    }
}
