use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Crawl throughput counters
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    metrics: Arc<Mutex<Metrics>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub start_time: DateTime<Utc>,

    /// Requests that reached a final outcome
    pub total_requests: usize,

    pub successful_requests: usize,

    pub failed_requests: usize,

    /// Attempts that failed and were requeued
    pub retried_requests: usize,

    pub bytes_downloaded: usize,

    /// Sum of request durations in milliseconds
    pub total_duration_ms: u64,

    pub status_codes: HashMap<u16, usize>,

    pub current_rps: f64,

    pub peak_rps: f64,
}

impl Metrics {
    pub fn average_duration_ms(&self) -> Option<u64> {
        let attempts = self.total_requests + self.retried_requests;
        (attempts > 0).then(|| self.total_duration_ms / attempts as u64)
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        let metrics = Metrics {
            start_time: Utc::now(),
            ..Default::default()
        };

        Self {
            metrics: Arc::new(Mutex::new(metrics)),
        }
    }

    /// Record a request's final outcome
    pub async fn record_request(&self, success: bool, duration_ms: u64, status_code: Option<u16>, bytes: usize) {
        let mut metrics = self.metrics.lock().await;

        metrics.total_requests += 1;
        if success {
            metrics.successful_requests += 1;
        } else {
            metrics.failed_requests += 1;
        }

        metrics.bytes_downloaded += bytes;
        metrics.total_duration_ms += duration_ms;

        if let Some(code) = status_code {
            *metrics.status_codes.entry(code).or_default() += 1;
        }

        let elapsed_seconds = (Utc::now() - metrics.start_time).num_milliseconds().max(1_000) as f64 / 1_000.0;
        metrics.current_rps = metrics.total_requests as f64 / elapsed_seconds;
        metrics.peak_rps = metrics.peak_rps.max(metrics.current_rps);
    }

    /// Record a failed attempt that will be retried
    pub async fn record_retry(&self, duration_ms: u64) {
        let mut metrics = self.metrics.lock().await;
        metrics.retried_requests += 1;
        metrics.total_duration_ms += duration_ms;
    }

    pub fn start_timer(&self) -> RequestTimer {
        RequestTimer {
            start: Instant::now(),
        }
    }

    pub async fn get_metrics(&self) -> Metrics {
        self.metrics.lock().await.clone()
    }

    pub async fn reset(&self) {
        let mut metrics = self.metrics.lock().await;
        *metrics = Metrics {
            start_time: Utc::now(),
            ..Default::default()
        };
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RequestTimer {
    start: Instant,
}

impl RequestTimer {
    /// Elapsed milliseconds
    pub fn end(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts_outcomes_and_retries() {
        let collector = MetricsCollector::new();

        collector.record_request(true, 100, Some(200), 1_024).await;
        collector.record_request(true, 300, Some(200), 2_048).await;
        collector.record_retry(50).await;
        collector.record_request(false, 150, Some(503), 0).await;

        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.successful_requests, 2);
        assert_eq!(metrics.failed_requests, 1);
        assert_eq!(metrics.retried_requests, 1);
        assert_eq!(metrics.bytes_downloaded, 3_072);
        assert_eq!(metrics.status_codes.get(&200), Some(&2));
        assert_eq!(metrics.average_duration_ms(), Some(150));
        assert!(metrics.peak_rps >= metrics.current_rps);

        collector.reset().await;
        assert_eq!(collector.get_metrics().await.total_requests, 0);
    }
}
