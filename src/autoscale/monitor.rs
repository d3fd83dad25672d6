use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::MonitorSettings;

/// Source of the process memory ratio (process resident / system total)
pub trait MemorySampler: Send + Sync {
    fn sample(&self) -> Result<f64>;
}

/// Reads resident set size and total memory from procfs
pub struct ProcMemorySampler;

fn read_kib(contents: &str, field: &str) -> Option<u64> {
    contents
        .lines()
        .find(|line| line.starts_with(field))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|value| value.parse().ok())
}

impl MemorySampler for ProcMemorySampler {
    fn sample(&self) -> Result<f64> {
        let status = std::fs::read_to_string("/proc/self/status").context("Failed to read process status")?;
        let meminfo = std::fs::read_to_string("/proc/meminfo").context("Failed to read system memory info")?;

        let resident = read_kib(&status, "VmRSS:").context("VmRSS missing from process status")?;
        let total = read_kib(&meminfo, "MemTotal:").context("MemTotal missing from memory info")?;
        if total == 0 {
            anyhow::bail!("System reports zero total memory");
        }

        Ok(resident as f64 / total as f64)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MemorySnapshot {
    pub at: Instant,
    pub ratio: f64,
}

/// Sliding window of memory samples
pub struct ResourceMonitor {
    settings: MonitorSettings,
    sampler: Arc<dyn MemorySampler>,
    snapshots: Mutex<VecDeque<MemorySnapshot>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceMonitor {
    pub fn new(settings: MonitorSettings, sampler: Arc<dyn MemorySampler>) -> Self {
        Self {
            settings,
            sampler,
            snapshots: Mutex::new(VecDeque::new()),
            task: Mutex::new(None),
        }
    }

    pub async fn record(&self, ratio: f64, at: Instant) {
        let max_age = Duration::from_millis(self.settings.max_snapshot_age_ms);
        let mut snapshots = self.snapshots.lock().await;

        snapshots.push_back(MemorySnapshot { at, ratio });
        while let Some(oldest) = snapshots.front() {
            if at.saturating_duration_since(oldest.at) > max_age {
                snapshots.pop_front();
            } else {
                break;
            }
        }
    }

    /// Take one sample now
    pub async fn sample(&self) {
        match self.sampler.sample() {
            Ok(ratio) => self.record(ratio, Instant::now()).await,
            Err(e) => warn!("Memory sampling failed: {:#}", e),
        }
    }

    /// Time-weighted average of the window; each sample counts for the time
    /// elapsed since the previous one
    pub async fn weighted_ratio(&self) -> Option<f64> {
        let snapshots = self.snapshots.lock().await;
        match snapshots.len() {
            0 => None,
            1 => snapshots.front().map(|s| s.ratio),
            _ => {
                let mut weighted = 0.0;
                let mut total = 0.0;
                for (previous, current) in snapshots.iter().zip(snapshots.iter().skip(1)) {
                    let weight = current.at.saturating_duration_since(previous.at).as_secs_f64();
                    weighted += current.ratio * weight;
                    total += weight;
                }

                if total > 0.0 {
                    Some(weighted / total)
                } else {
                    snapshots.back().map(|s| s.ratio)
                }
            }
        }
    }

    pub async fn is_overloaded(&self) -> bool {
        self.weighted_ratio()
            .await
            .map(|ratio| ratio > self.settings.max_memory_ratio)
            .unwrap_or(false)
    }

    /// Sample on `memory_interval_ms` until stopped
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let monitor = Arc::clone(self);
        let period = Duration::from_millis(self.settings.memory_interval_ms.max(1));
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                monitor.sample().await;
            }
        }));
        debug!("Memory monitor started");
    }

    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }
}
