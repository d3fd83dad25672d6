use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PersistenceSettings;
use crate::storage::kv::KeyValueStore;
use crate::storage::queue::PersistentRequestQueue;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CrawlPhase {
    #[default]
    Initializing,
    Crawling,
    Draining,
    Finished,
}

/// Checkpointed crawl progress
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrawlState {
    pub queue_id: String,
    pub last_processed_url: Option<String>,
    pub phase: CrawlPhase,
    pub total_requests: u64,
    pub completed_requests: u64,
    pub failed_requests: u64,
    pub timestamp: DateTime<Utc>,
}

/// State read back by `StatePersister::restore`
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredState {
    pub state: CrawlState,
    pub queue_state: Option<serde_json::Value>,
}

fn state_key(queue_id: &str) -> String {
    format!("crawler:state:{}", queue_id)
}

fn queue_state_key(queue_id: &str) -> String {
    format!("crawler:state:{}:queue", queue_id)
}

/// Periodically checkpoints crawl progress to a key-value store
pub struct StatePersister {
    store: Arc<dyn KeyValueStore>,
    settings: PersistenceSettings,
    state: Mutex<CrawlState>,
    queue: Option<Arc<PersistentRequestQueue>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl StatePersister {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        settings: PersistenceSettings,
        queue_id: &str,
        queue: Option<Arc<PersistentRequestQueue>>,
    ) -> Self {
        let state = CrawlState {
            queue_id: queue_id.to_string(),
            last_processed_url: None,
            phase: CrawlPhase::Initializing,
            total_requests: 0,
            completed_requests: 0,
            failed_requests: 0,
            timestamp: Utc::now(),
        };

        Self {
            store,
            settings,
            state: Mutex::new(state),
            queue,
            timer: Mutex::new(None),
        }
    }

    /// Continue from a restored checkpoint instead of zeroed counters
    pub fn with_state(mut self, restored: CrawlState) -> Self {
        let state = self.state.get_mut();
        *state = CrawlState {
            queue_id: state.queue_id.clone(),
            ..restored
        };
        self
    }

    /// Mutate the in-memory state; it is written on the next persist
    pub async fn update(&self, f: impl FnOnce(&mut CrawlState)) {
        let mut state = self.state.lock().await;
        f(&mut state);
    }

    pub async fn snapshot(&self) -> CrawlState {
        self.state.lock().await.clone()
    }

    /// Write the current state (and queue state, when attached) to the store
    pub async fn persist(&self) -> Result<()> {
        let ttl = Some(Duration::from_secs(self.settings.ttl_secs));

        let state = {
            let mut state = self.state.lock().await;
            state.timestamp = Utc::now();
            state.clone()
        };

        let payload = serde_json::to_string(&state).context("Failed to serialize crawl state")?;
        self.store
            .set(&state_key(&state.queue_id), payload, ttl)
            .await
            .context("Failed to persist crawl state")?;

        if let Some(queue) = &self.queue {
            let queue_state = queue.state().await?;
            self.store
                .set(&queue_state_key(&state.queue_id), queue_state.to_string(), ttl)
                .await
                .context("Failed to persist queue state")?;
        }

        debug!(
            "Persisted state for {} ({} completed, {} failed)",
            state.queue_id, state.completed_requests, state.failed_requests
        );

        Ok(())
    }

    /// Persist, logging instead of propagating failures
    pub async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            error!("State persistence failed: {:#}", e);
        }
    }

    /// Start the periodic checkpoint timer
    pub async fn start(self: &Arc<Self>) {
        let mut timer = self.timer.lock().await;
        if timer.is_some() {
            return;
        }

        let period = Duration::from_millis(self.settings.persist_interval_ms.max(1));
        let persister = Arc::clone(self);

        *timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                persister.persist_logged().await;
            }
        }));
    }

    /// Stop the periodic timer
    pub async fn stop(&self) {
        if let Some(handle) = self.timer.lock().await.take() {
            handle.abort();
            debug!("State persistence timer stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.timer.lock().await.is_some()
    }

    /// Read a previously persisted state, if any
    pub async fn restore(store: &dyn KeyValueStore, queue_id: &str) -> Result<Option<RestoredState>> {
        let Some(raw) = store.get(&state_key(queue_id)).await? else {
            return Ok(None);
        };

        let state: CrawlState = serde_json::from_str(&raw).context("Failed to parse persisted crawl state")?;

        let queue_state = match store.get(&queue_state_key(queue_id)).await? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("Ignoring unreadable queue state for {}: {}", queue_id, e);
                    None
                }
            },
            None => None,
        };

        info!("Restored state for {} (phase {:?})", queue_id, state.phase);

        Ok(Some(RestoredState { state, queue_state }))
    }

    /// Make this persister the process shutdown hook.
    ///
    /// On SIGINT/SIGTERM the timer is stopped and one final persist is
    /// awaited. The process itself is left running.
    pub async fn register_shutdown_handlers(self: &Arc<Self>) {
        let persister = Arc::clone(self);
        register_shutdown_hook(Arc::new(move || {
            let persister = persister.clone();
            async move {
                persister.stop().await;
                persister.update(|state| state.phase = CrawlPhase::Draining).await;
                persister.persist_logged().await;
            }
            .boxed()
        }))
        .await;
    }
}

/// Callback run when the process is asked to terminate
pub type ShutdownHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Process-wide signal registration.
///
/// Signal listeners are installed at most once per process; registering
/// again only replaces the hook that will run.
struct SignalRegistry {
    installed: AtomicBool,
    hook: Mutex<Option<ShutdownHook>>,
    completed: watch::Sender<bool>,
}

static SIGNALS: Lazy<SignalRegistry> = Lazy::new(|| SignalRegistry {
    installed: AtomicBool::new(false),
    hook: Mutex::new(None),
    completed: watch::channel(false).0,
});

pub async fn register_shutdown_hook(hook: ShutdownHook) {
    *SIGNALS.hook.lock().await = Some(hook);

    if SIGNALS.installed.swap(true, Ordering::SeqCst) {
        debug!("Shutdown hook replaced");
        return;
    }

    tokio::spawn(async {
        wait_for_termination().await;
        info!("Termination signal received, running shutdown hook");
        trigger_shutdown().await;
    });
    debug!("Installed termination signal handlers");
}

/// Run the registered hook now, as a signal would
pub async fn trigger_shutdown() {
    let hook = SIGNALS.hook.lock().await.clone();
    if let Some(hook) = hook {
        hook().await;
    }
    SIGNALS.completed.send_replace(true);
}

/// Flips to `true` once the shutdown hook has finished
pub fn shutdown_requested() -> watch::Receiver<bool> {
    SIGNALS.completed.subscribe()
}

pub fn signal_handlers_installed() -> bool {
    SIGNALS.installed.load(Ordering::SeqCst)
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
