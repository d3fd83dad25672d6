use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::QueueSettings;
use crate::crawler::request::CrawlRequest;
use crate::storage::memory::InMemoryQueue;
use crate::storage::redis::RedisQueue;
use crate::storage::strategy::{self, QueueStrategy};

/// Dedup-aware acknowledgement of an enqueue attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOperationInfo {
    pub was_already_present: bool,
    pub unique_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Waiting to be fetched
    pub pending: usize,
    /// Fetched but not yet completed or failed
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    /// Distinct requests ever accepted
    pub total: usize,
}

/// Storage backend behind the request queue
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Insert unless the key is pending, in progress, completed or failed
    async fn add(&self, request: &CrawlRequest) -> Result<QueueOperationInfo>;

    /// Claim the lowest scored pending request
    async fn fetch_next(&self) -> Result<Option<CrawlRequest>>;

    /// Put an in-progress request back with one more attempt recorded
    async fn reclaim(&self, request: &CrawlRequest) -> Result<()>;

    async fn mark_completed(&self, unique_key: &str) -> Result<()>;

    async fn mark_failed(&self, unique_key: &str, error: &str) -> Result<()>;

    async fn stats(&self) -> Result<QueueStats>;

    fn name(&self) -> &'static str;
}

/// Requests accepted by the first batch, plus a handle on the remaining ones
pub struct BatchedAddResult {
    pub processed: Vec<QueueOperationInfo>,
    pub remaining: JoinHandle<Vec<QueueOperationInfo>>,
}

/// Durable, deduplicated request queue.
///
/// Uses Redis when configured; if the store becomes unreachable the queue
/// switches to process memory for the rest of its lifetime.
pub struct PersistentRequestQueue {
    id: String,
    backend: RwLock<Arc<dyn QueueBackend>>,
    strategy: Arc<dyn QueueStrategy>,
    degraded: AtomicBool,
    batch_size: usize,
}

impl PersistentRequestQueue {
    /// Open the queue described by `settings`
    pub async fn open(settings: &QueueSettings) -> Result<Self> {
        let strategy = strategy::from_name(&settings.strategy)?;

        let backend: Arc<dyn QueueBackend> = match &settings.redis_url {
            Some(redis_url) => match RedisQueue::connect(redis_url, &settings.queue_id, settings.task_ttl, strategy.clone()).await {
                Ok(queue) => Arc::new(queue),
                Err(e) => {
                    warn!("Redis unavailable ({:#}), using in-memory queue", e);
                    Arc::new(InMemoryQueue::new(strategy.clone()))
                }
            },
            None => Arc::new(InMemoryQueue::new(strategy.clone())),
        };

        Ok(Self::with_backend(&settings.queue_id, backend, strategy, settings.batch_size))
    }

    /// In-memory queue with the given strategy
    pub fn in_memory(id: &str, strategy: Arc<dyn QueueStrategy>) -> Self {
        let backend = Arc::new(InMemoryQueue::new(strategy.clone()));
        Self::with_backend(id, backend, strategy, 25)
    }

    pub fn with_backend(
        id: &str,
        backend: Arc<dyn QueueBackend>,
        strategy: Arc<dyn QueueStrategy>,
        batch_size: usize,
    ) -> Self {
        debug!("Opened request queue {} ({} backend, {})", id, backend.name(), strategy.name());
        Self {
            id: id.to_string(),
            backend: RwLock::new(backend),
            strategy,
            degraded: AtomicBool::new(false),
            batch_size: batch_size.max(1),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn backend_name(&self) -> &'static str {
        self.backend.read().await.name()
    }

    /// Run `op` against the backend, falling back to memory on store failure
    async fn with_backend_op<T, F>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn QueueBackend>) -> BoxFuture<'static, Result<T>>,
    {
        let backend = self.backend.read().await.clone();

        match op(backend.clone()).await {
            Ok(value) => Ok(value),
            Err(e) if !self.degraded.load(Ordering::SeqCst) && backend.name() != "memory" => {
                self.degrade(&e).await;
                let fallback = self.backend.read().await.clone();
                op(fallback).await
            }
            Err(e) => Err(e),
        }
    }

    async fn degrade(&self, cause: &anyhow::Error) {
        if self.degraded.swap(true, Ordering::SeqCst) {
            return;
        }

        error!(
            "Queue {} lost its key-value store ({:#}); continuing in memory for this process",
            self.id, cause
        );
        *self.backend.write().await = Arc::new(InMemoryQueue::new(self.strategy.clone()));
    }

    pub async fn add_request(&self, request: CrawlRequest) -> Result<QueueOperationInfo> {
        let request = Arc::new(request);
        self.with_backend_op(move |backend| {
            let request = request.clone();
            async move { backend.add(&request).await }.boxed()
        })
        .await
    }

    /// Add every request, batch by batch, before returning
    pub async fn add_requests(&self, requests: Vec<CrawlRequest>) -> Result<Vec<QueueOperationInfo>> {
        let mut infos = Vec::with_capacity(requests.len());
        let mut iter = requests.into_iter().peekable();

        while iter.peek().is_some() {
            let batch: Vec<CrawlRequest> = iter.by_ref().take(self.batch_size).collect();
            for request in batch {
                infos.push(self.add_request(request).await?);
            }
        }

        Ok(infos)
    }

    /// Add the first batch, then keep adding the rest in the background
    pub async fn add_requests_batched(self: &Arc<Self>, mut requests: Vec<CrawlRequest>) -> Result<BatchedAddResult> {
        let rest = if requests.len() > self.batch_size {
            requests.split_off(self.batch_size)
        } else {
            Vec::new()
        };

        let processed = self.add_requests(requests).await?;

        let queue = Arc::clone(self);
        let remaining = tokio::spawn(async move {
            match queue.add_requests(rest).await {
                Ok(infos) => infos,
                Err(e) => {
                    error!("Background enqueue for queue {} failed: {:#}", queue.id, e);
                    Vec::new()
                }
            }
        });

        Ok(BatchedAddResult { processed, remaining })
    }

    pub async fn fetch_next_request(&self) -> Result<Option<CrawlRequest>> {
        self.with_backend_op(|backend| async move { backend.fetch_next().await }.boxed())
            .await
    }

    /// Requeue a failed request for another attempt
    pub async fn reclaim_request(&self, request: &CrawlRequest) -> Result<()> {
        let request = Arc::new(request.clone());
        self.with_backend_op(move |backend| {
            let request = request.clone();
            async move { backend.reclaim(&request).await }.boxed()
        })
        .await
    }

    pub async fn mark_completed(&self, request: &CrawlRequest) -> Result<()> {
        let key = request.unique_key.clone();
        self.with_backend_op(move |backend| {
            let key = key.clone();
            async move { backend.mark_completed(&key).await }.boxed()
        })
        .await
    }

    pub async fn mark_failed(&self, request: &CrawlRequest, error: &str) -> Result<()> {
        let key = request.unique_key.clone();
        let error = error.to_string();
        self.with_backend_op(move |backend| {
            let key = key.clone();
            let error = error.clone();
            async move { backend.mark_failed(&key, &error).await }.boxed()
        })
        .await
    }

    pub async fn get_stats(&self) -> Result<QueueStats> {
        self.with_backend_op(|backend| async move { backend.stats().await }.boxed())
            .await
    }

    /// No request is waiting to be fetched
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.get_stats().await?.pending == 0)
    }

    /// Nothing pending and nothing in flight
    pub async fn is_finished(&self) -> Result<bool> {
        let stats = self.get_stats().await?;
        Ok(stats.pending == 0 && stats.in_progress == 0)
    }

    /// Opaque snapshot for state persistence
    pub async fn state(&self) -> Result<serde_json::Value> {
        let stats = self.get_stats().await?;
        Ok(serde_json::json!({
            "queueId": self.id,
            "backend": self.backend_name().await,
            "strategy": self.strategy.name(),
            "degraded": self.degraded.load(Ordering::SeqCst),
            "stats": stats,
        }))
    }
}
