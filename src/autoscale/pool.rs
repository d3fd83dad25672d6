use anyhow::Result;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::autoscale::LoadSignals;
use crate::config::AutoscaleSettings;

pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;
pub type PredicateFn = Arc<dyn Fn() -> BoxFuture<'static, Result<bool>> + Send + Sync>;

/// Work supplied by the pool's owner
#[derive(Clone)]
pub struct PoolCallbacks {
    /// Run one unit of work
    pub run_task: TaskFn,
    /// Whether a unit of work is available right now
    pub is_task_ready: PredicateFn,
    /// Whether all work is done; checked only when nothing is in flight
    pub is_finished: PredicateFn,
}

/// Decrements the in-flight count when a task ends, even on panic
struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
    done: Arc<Notify>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.done.notify_one();
    }
}

/// Worker pool whose target size follows load signals.
///
/// Stopping and pausing are cooperative: running tasks are always allowed
/// to finish.
pub struct AutoscaledPool {
    min_concurrency: usize,
    max_concurrency: usize,
    scale_up_step_ratio: f64,
    scale_down_step_ratio: f64,
    scale_interval: Duration,
    maybe_run_interval: Duration,
    signals: Arc<dyn LoadSignals>,
    callbacks: PoolCallbacks,
    desired: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    running: AtomicBool,
    paused: AtomicBool,
    task_done: Arc<Notify>,
}

impl AutoscaledPool {
    pub fn new(settings: &AutoscaleSettings, signals: Arc<dyn LoadSignals>, callbacks: PoolCallbacks) -> Self {
        let min_concurrency = settings.min_concurrency.max(1);
        let max_concurrency = settings.max_concurrency.max(min_concurrency);
        let desired = settings.desired_concurrency.clamp(min_concurrency, max_concurrency);

        Self {
            min_concurrency,
            max_concurrency,
            scale_up_step_ratio: settings.scale_up_step_ratio,
            scale_down_step_ratio: settings.scale_down_step_ratio,
            scale_interval: Duration::from_millis(settings.scale_interval_ms.max(1)),
            maybe_run_interval: Duration::from_millis(settings.maybe_run_interval_ms.max(1)),
            signals,
            callbacks,
            desired: AtomicUsize::new(desired),
            in_flight: Arc::new(AtomicUsize::new(0)),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            task_done: Arc::new(Notify::new()),
        }
    }

    pub fn desired_concurrency(&self) -> usize {
        self.desired.load(Ordering::SeqCst)
    }

    pub fn current_concurrency(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Stop spawning; `run` returns once in-flight tasks have drained
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Stopping pool, waiting for {} running tasks", self.current_concurrency());
        }
        self.task_done.notify_one();
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        debug!("Pool paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.task_done.notify_one();
        debug!("Pool resumed");
    }

    /// Resize the target concurrency from the current load signals
    pub async fn adjust_concurrency(&self) {
        let current = self.desired_concurrency();

        let next = if self.signals.is_overloaded().await {
            let step = (current as f64 * self.scale_down_step_ratio).ceil() as usize;
            current.saturating_sub(step).max(self.min_concurrency)
        } else if self.signals.is_underutilized().await {
            let step = (current as f64 * self.scale_up_step_ratio).ceil() as usize;
            current.saturating_add(step).min(self.max_concurrency)
        } else {
            current
        };

        if next != current {
            info!("Desired concurrency {} -> {}", current, next);
            self.desired.store(next, Ordering::SeqCst);
        }
    }

    fn spawn_task(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
            done: self.task_done.clone(),
        };
        let task = (self.callbacks.run_task)();

        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = task.await {
                error!("Pool task failed: {:#}", e);
            }
        });
    }

    /// Run until the finished predicate holds with nothing in flight, or
    /// until `stop` is called
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            anyhow::bail!("Pool is already running");
        }

        info!(
            "Pool started (desired concurrency {}, bounds {}..={})",
            self.desired_concurrency(),
            self.min_concurrency,
            self.max_concurrency
        );

        let scaler = {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(pool.scale_interval).await;
                    if !pool.is_running() {
                        break;
                    }
                    pool.adjust_concurrency().await;
                }
            })
        };

        let outcome = self.spawn_loop().await;

        self.running.store(false, Ordering::SeqCst);
        scaler.abort();
        self.drain().await;

        info!("Pool finished");
        outcome
    }

    async fn spawn_loop(&self) -> Result<()> {
        while self.is_running() {
            if self.current_concurrency() == 0 && (self.callbacks.is_finished)().await? {
                debug!("All work finished");
                break;
            }

            if !self.is_paused()
                && self.current_concurrency() < self.desired_concurrency()
                && (self.callbacks.is_task_ready)().await?
            {
                self.spawn_task();
                continue;
            }

            tokio::select! {
                _ = self.task_done.notified() => {}
                _ = tokio::time::sleep(self.maybe_run_interval) => {}
            }
        }

        Ok(())
    }

    async fn drain(&self) {
        while self.current_concurrency() > 0 {
            tokio::select! {
                _ = self.task_done.notified() => {}
                _ = tokio::time::sleep(self.maybe_run_interval) => {}
            }
        }
    }
}
