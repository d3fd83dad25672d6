use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::ErrorSettings;
use crate::diagnostics::snapshot::{ErrorSnapshotter, SnapshotSource};
use crate::error::CrawlError;

/// The parts of a failure used to group it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub name: String,
    pub code: Option<String>,
    pub message: String,
    /// First frame outside the runtime and dependencies, if captured
    pub location: Option<String>,
}

impl ErrorRecord {
    pub fn from_error(err: &anyhow::Error) -> Self {
        let crawl_error = err.downcast_ref::<CrawlError>();

        // Keep per-URL failures of one kind in the same group
        let mut message = format!("{:#}", err);
        if let Some(url) = crawl_error.and_then(CrawlError::url).filter(|url| !url.is_empty()) {
            message = message.replace(url, "<URL>");
        }

        Self {
            name: crawl_error.map(CrawlError::name).unwrap_or("Error").to_string(),
            code: crawl_error.and_then(CrawlError::code),
            message,
            location: location_from_backtrace(&err.backtrace().to_string()),
        }
    }
}

/// Turn on error backtraces unless the environment already decided.
///
/// The standard library reads these variables once, so this has to run
/// before the first error is created.
pub fn enable_error_backtraces() {
    let decided = ["RUST_BACKTRACE", "RUST_LIB_BACKTRACE"]
        .iter()
        .any(|name| std::env::var_os(name).is_some());
    if !decided {
        std::env::set_var("RUST_LIB_BACKTRACE", "1");
    }
}

/// First `at <path>` line of a rendered backtrace that points into this crate
pub fn location_from_backtrace(backtrace: &str) -> Option<String> {
    const FOREIGN: [&str; 7] = [
        "/rustc/",
        "/registry/src/",
        "/git/checkouts/",
        "/library/std/",
        "/library/core/",
        "/library/alloc/",
        "/toolchains/",
    ];

    backtrace
        .lines()
        .filter_map(|line| line.trim().strip_prefix("at "))
        .find(|path| !FOREIGN.iter().any(|marker| path.contains(marker)))
        .map(str::to_string)
}

/// Replace every run of digits with `<N>`
pub fn normalize_message(message: &str) -> String {
    let mut normalized = String::with_capacity(message.len());
    let mut in_digits = false;

    for c in message.chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                normalized.push_str("<N>");
            }
            in_digits = true;
        } else {
            normalized.push(c);
            in_digits = false;
        }
    }

    normalized
}

/// Errors sharing one signature
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorGroup {
    pub signature: String,
    pub name: String,
    pub code: Option<String>,
    /// Message of the first occurrence
    pub example_message: String,
    pub count: usize,
    pub first_occurrence: DateTime<Utc>,
    pub last_occurrence: DateTime<Utc>,
    pub snapshot_url: Option<String>,
    pub html_url: Option<String>,
}

/// Groups crawl failures by signature
pub struct ErrorTracker {
    settings: ErrorSettings,
    groups: Mutex<HashMap<String, ErrorGroup>>,
    snapshotter: Option<Arc<ErrorSnapshotter>>,
}

impl ErrorTracker {
    pub fn new(settings: ErrorSettings, snapshotter: Option<Arc<ErrorSnapshotter>>) -> Self {
        if settings.show_stack_location {
            enable_error_backtraces();
        }
        Self {
            settings,
            groups: Mutex::new(HashMap::new()),
            snapshotter,
        }
    }

    /// Grouping key built from the enabled components
    pub fn signature(&self, record: &ErrorRecord) -> String {
        let mut parts = Vec::new();

        if self.settings.show_stack_location {
            if let Some(location) = &record.location {
                parts.push(location.clone());
            }
        }
        if self.settings.show_error_code {
            if let Some(code) = &record.code {
                parts.push(code.clone());
            }
        }
        if self.settings.show_error_name {
            parts.push(record.name.clone());
        }

        let message = if self.settings.show_full_message {
            record.message.as_str()
        } else {
            record.message.lines().next().unwrap_or("")
        };
        parts.push(normalize_message(message));

        parts.join(" | ")
    }

    /// Count `record`; returns its signature and whether the group is new
    pub async fn add(&self, record: &ErrorRecord) -> (String, bool) {
        let signature = self.signature(record);
        let now = Utc::now();
        let mut groups = self.groups.lock().await;

        if let Some(group) = groups.get_mut(&signature) {
            group.count += 1;
            group.last_occurrence = now;
            return (signature, false);
        }

        info!("New error group: {}", signature);
        groups.insert(
            signature.clone(),
            ErrorGroup {
                signature: signature.clone(),
                name: record.name.clone(),
                code: record.code.clone(),
                example_message: record.message.clone(),
                count: 1,
                first_occurrence: now,
                last_occurrence: now,
                snapshot_url: None,
                html_url: None,
            },
        );

        (signature, true)
    }

    pub async fn add_error(&self, err: &anyhow::Error) -> (String, bool) {
        self.add(&ErrorRecord::from_error(err)).await
    }

    /// Count `err` and, for a new group, try to capture `source`.
    ///
    /// Capture problems never surface to the caller.
    pub async fn add_with_snapshot(&self, err: &anyhow::Error, source: SnapshotSource<'_>) -> String {
        let (signature, is_new) = self.add_error(err).await;

        if !is_new {
            return signature;
        }
        let Some(snapshotter) = &self.snapshotter else {
            return signature;
        };

        if let Some(snapshot) = snapshotter.capture(&signature, source).await {
            match self.groups.lock().await.get_mut(&signature) {
                Some(group) => {
                    group.snapshot_url = snapshot.screenshot_url;
                    group.html_url = snapshot.html_url;
                }
                None => warn!("Error group {} vanished before its snapshot was stored", signature),
            }
        }

        signature
    }

    /// Groups by descending count
    pub async fn get_most_popular_errors(&self, limit: usize) -> Vec<ErrorGroup> {
        let mut groups: Vec<ErrorGroup> = self.groups.lock().await.values().cloned().collect();
        groups.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.first_occurrence.cmp(&b.first_occurrence))
        });
        groups.truncate(limit);
        groups
    }

    pub async fn total(&self) -> usize {
        self.groups.lock().await.values().map(|g| g.count).sum()
    }

    pub async fn group_count(&self) -> usize {
        self.groups.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::object::FileObjectStore;

    fn record(message: &str, location: &str) -> ErrorRecord {
        ErrorRecord {
            name: "TimeoutError".to_string(),
            code: None,
            message: message.to_string(),
            location: Some(location.to_string()),
        }
    }

    fn tracker() -> ErrorTracker {
        ErrorTracker::new(ErrorSettings::default(), None)
    }

    #[test]
    fn test_normalize_message() {
        assert_eq!(normalize_message("Timeout after 5000ms"), "Timeout after <N>ms");
        assert_eq!(normalize_message("HTTP 503 on /page/12?id=7"), "HTTP <N> on /page/<N>?id=<N>");
        assert_eq!(normalize_message("no digits"), "no digits");
    }

    #[test]
    fn test_location_from_backtrace() {
        let backtrace = "   0: std::backtrace::Backtrace::create
             at /rustc/abc123/library/std/src/backtrace.rs:331:13
   1: anyhow::error::<impl anyhow::Error>::msg
             at /home/dev/.cargo/registry/src/index.crates.io-6f17d22bba15001f/anyhow-1.0.75/src/error.rs:83:36
   2: adaptive_crawler::crawler::static_crawler::StaticCrawler::fetch
             at ./src/crawler/static_crawler.rs:58:17
   3: main
             at ./src/main.rs:20:5";

        assert_eq!(
            location_from_backtrace(backtrace).as_deref(),
            Some("./src/crawler/static_crawler.rs:58:17")
        );
        assert_eq!(location_from_backtrace("disabled backtrace"), None);
    }

    #[test]
    fn test_location_skips_git_and_toolchain_frames() {
        let backtrace = "   0: anyhow::error::<impl anyhow::Error>::msg
             at /opt/cargo/git/checkouts/anyhow-1a2b3c/abcdef0/src/error.rs:83:36
   1: core::ops::function::FnOnce::call_once
             at /opt/rustup/toolchains/stable-x86_64-unknown-linux-gnu/lib/rustlib/src/rust/library/core/src/ops/function.rs:250:5
   2: adaptive_crawler::crawler::runner::Crawler::process_next
             at /build/src/crawler/runner.rs:210:9";

        assert_eq!(
            location_from_backtrace(backtrace).as_deref(),
            Some("/build/src/crawler/runner.rs:210:9")
        );
    }

    #[tokio::test]
    async fn test_numeric_variants_collapse_into_one_group() {
        let tracker = tracker();

        let (first, new_first) = tracker.add(&record("Timeout after 5000ms", "src/fetch.rs:10:5")).await;
        let (second, new_second) = tracker.add(&record("Timeout after 12ms", "src/fetch.rs:10:5")).await;
        let (third, new_third) = tracker.add(&record("Timeout after 12ms", "src/render.rs:40:9")).await;

        assert_eq!(first, second);
        assert_ne!(first, third);
        assert!(new_first && !new_second && new_third);

        let groups = tracker.get_most_popular_errors(10).await;
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].signature, first);
        assert_eq!(groups[0].count, 2);
        assert_eq!(groups[1].count, 1);
        assert_eq!(tracker.total().await, 3);
    }

    #[tokio::test]
    async fn test_signature_components_are_configurable() {
        let tracker = ErrorTracker::new(
            ErrorSettings {
                show_stack_location: false,
                show_error_name: false,
                show_full_message: false,
                ..ErrorSettings::default()
            },
            None,
        );

        let signature = tracker.signature(&ErrorRecord {
            name: "HttpError".to_string(),
            code: Some("HTTP_503".to_string()),
            message: "HTTP status 503 received\ncaused by upstream".to_string(),
            location: Some("src/a.rs:1:1".to_string()),
        });

        assert_eq!(signature, "HTTP_503 | HTTP status <N> received");
    }

    #[tokio::test]
    async fn test_crawl_errors_carry_name_and_code() {
        let err = anyhow::Error::new(CrawlError::Timeout {
            url: "https://example.com/".to_string(),
            timeout_ms: 5000,
        });
        let record = ErrorRecord::from_error(&err);

        assert_eq!(record.name, "TimeoutError");
        assert_eq!(record.code.as_deref(), Some("ETIMEDOUT"));
        assert_eq!(record.message, "Request to <URL> timed out after 5000ms");
    }

    #[tokio::test]
    async fn test_snapshot_only_for_first_occurrence() {
        let dir = tempfile::tempdir().unwrap();
        let snapshotter = Arc::new(ErrorSnapshotter::new(Arc::new(FileObjectStore::new(dir.path())), 10));
        let tracker = ErrorTracker::new(ErrorSettings::default(), Some(snapshotter.clone()));

        let blocked = |status: u16| {
            anyhow::Error::new(CrawlError::Blocked {
                url: "https://example.com/".to_string(),
                status,
                body: Some("<html>captcha</html>".to_string()),
            })
        };

        for _ in 0..3 {
            let err = blocked(403);
            let body = err.downcast_ref::<CrawlError>().and_then(CrawlError::body).unwrap_or("");
            tracker.add_with_snapshot(&err, SnapshotSource::Html(body)).await;
        }

        assert_eq!(snapshotter.taken(), 1);
        let groups = tracker.get_most_popular_errors(1).await;
        assert_eq!(groups[0].count, 3);
        assert!(groups[0].html_url.as_deref().unwrap().starts_with("file://"));
        assert_eq!(groups[0].snapshot_url, None);
    }

    #[tokio::test]
    async fn test_live_page_snapshot_records_screenshot() {
        let dir = tempfile::tempdir().unwrap();
        let snapshotter = Arc::new(ErrorSnapshotter::new(Arc::new(FileObjectStore::new(dir.path())), 10));
        let tracker = ErrorTracker::new(ErrorSettings::default(), Some(snapshotter));

        let mut page = crate::browser::page::MockPageHandle::new();
        page.expect_screenshot().times(1).returning(|| Ok(vec![0x89, 0x50, 0x4e, 0x47]));
        page.expect_content().times(1).returning(|| Ok("<html>checkout broke</html>".to_string()));

        let err = anyhow::anyhow!("checkout button missing");
        tracker.add_with_snapshot(&err, SnapshotSource::Page(&page)).await;

        let group = &tracker.get_most_popular_errors(1).await[0];
        assert!(group.snapshot_url.as_deref().unwrap().ends_with(".png"));
        assert!(group.html_url.as_deref().unwrap().ends_with(".html"));
    }
}
