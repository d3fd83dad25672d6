use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::autoscale::monitor::ResourceMonitor;
use crate::autoscale::LoadSignals;
use crate::config::MonitorSettings;

#[derive(Debug, Clone, Copy)]
pub struct LoopSample {
    pub at: Instant,
    /// Delay past the expected tick
    pub lag: Duration,
    pub overloaded: bool,
}

/// Tracks runtime responsiveness by timing a fixed-interval tick, and
/// combines it with memory pressure into load signals
pub struct Snapshotter {
    settings: MonitorSettings,
    memory: Arc<ResourceMonitor>,
    samples: Mutex<VecDeque<LoopSample>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Snapshotter {
    pub fn new(settings: MonitorSettings, memory: Arc<ResourceMonitor>) -> Self {
        Self {
            settings,
            memory,
            samples: Mutex::new(VecDeque::new()),
            task: Mutex::new(None),
        }
    }

    fn retention(&self) -> Duration {
        Duration::from_millis(self.settings.idle_window_ms.max(self.settings.overload_window_ms))
    }

    /// Record a tick that was expected after `expected` but took `actual`
    pub async fn record_tick(&self, expected: Duration, actual: Duration, at: Instant) {
        let lag = actual.saturating_sub(expected);
        let overloaded = lag > Duration::from_millis(self.settings.max_blocked_ms);

        let retention = self.retention();
        let mut samples = self.samples.lock().await;
        samples.push_back(LoopSample { at, lag, overloaded });
        while let Some(oldest) = samples.front() {
            if at.saturating_duration_since(oldest.at) > retention {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    async fn window(&self, window: Duration) -> Vec<LoopSample> {
        let now = Instant::now();
        self.samples
            .lock()
            .await
            .iter()
            .filter(|sample| now.saturating_duration_since(sample.at) <= window)
            .copied()
            .collect()
    }

    /// Whether more than `threshold` of the samples within `window` were late
    pub async fn is_event_loop_overloaded(&self, window: Duration, threshold: f64) -> bool {
        let samples = self.window(window).await;
        if samples.is_empty() {
            return false;
        }

        let late = samples.iter().filter(|s| s.overloaded).count();
        late as f64 / samples.len() as f64 > threshold
    }

    /// No late tick within `window`, and the window actually holds samples
    pub async fn is_event_loop_idle(&self, window: Duration) -> bool {
        let samples = self.window(window).await;
        !samples.is_empty() && samples.iter().all(|s| !s.overloaded)
    }

    pub fn memory(&self) -> &Arc<ResourceMonitor> {
        &self.memory
    }

    /// Start tick timing and memory sampling
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        self.memory.start().await;

        let snapshotter = Arc::clone(self);
        let interval = Duration::from_millis(self.settings.event_loop_interval_ms.max(1));
        *task = Some(tokio::spawn(async move {
            loop {
                let started = Instant::now();
                tokio::time::sleep(interval).await;
                snapshotter.record_tick(interval, started.elapsed(), Instant::now()).await;
            }
        }));
        debug!("Snapshotter started");
    }

    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        self.memory.stop().await;
    }
}

#[async_trait]
impl LoadSignals for Snapshotter {
    async fn is_overloaded(&self) -> bool {
        let window = Duration::from_millis(self.settings.overload_window_ms);
        self.memory.is_overloaded().await
            || self
                .is_event_loop_overloaded(window, self.settings.overload_threshold)
                .await
    }

    async fn is_underutilized(&self) -> bool {
        let window = Duration::from_millis(self.settings.idle_window_ms);
        !self.memory.is_overloaded().await && self.is_event_loop_idle(window).await
    }
}
