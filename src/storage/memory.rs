use anyhow::Result;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::crawler::request::CrawlRequest;
use crate::storage::queue::{QueueBackend, QueueOperationInfo, QueueStats};
use crate::storage::strategy::QueueStrategy;

/// Position in the pending order: score first, insertion index as tie breaker
#[derive(Debug, Clone, PartialEq)]
struct Slot {
    score: f64,
    index: u64,
    unique_key: String,
}

impl Eq for Slot {}

impl PartialOrd for Slot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Slot {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then(self.index.cmp(&other.index))
    }
}

#[derive(Default)]
struct MemoryState {
    pending: BTreeSet<Slot>,
    /// Payloads of pending and in-progress requests
    requests: HashMap<String, CrawlRequest>,
    completed: HashSet<String>,
    failed: HashMap<String, String>,
    counter: u64,
}

/// Single-process queue backend
pub struct InMemoryQueue {
    strategy: Arc<dyn QueueStrategy>,
    state: Mutex<MemoryState>,
}

impl InMemoryQueue {
    pub fn new(strategy: Arc<dyn QueueStrategy>) -> Self {
        Self {
            strategy,
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn schedule(&self, state: &mut MemoryState, unique_key: &str) {
        state.counter += 1;
        let index = state.counter;
        state.pending.insert(Slot {
            score: self.strategy.score(index),
            index,
            unique_key: unique_key.to_string(),
        });
    }

    /// Error message recorded for a failed request
    pub async fn failure_reason(&self, unique_key: &str) -> Option<String> {
        self.state.lock().await.failed.get(unique_key).cloned()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    async fn add(&self, request: &CrawlRequest) -> Result<QueueOperationInfo> {
        let mut state = self.state.lock().await;
        let key = &request.unique_key;

        let present = state.completed.contains(key)
            || state.failed.contains_key(key)
            || state.requests.contains_key(key);

        if !present {
            state.requests.insert(key.clone(), request.clone());
            self.schedule(&mut state, key);
        }

        Ok(QueueOperationInfo {
            was_already_present: present,
            unique_key: key.clone(),
        })
    }

    async fn fetch_next(&self) -> Result<Option<CrawlRequest>> {
        let mut state = self.state.lock().await;

        while let Some(slot) = state.pending.pop_first() {
            if let Some(request) = state.requests.get(&slot.unique_key) {
                return Ok(Some(request.clone()));
            }
        }

        Ok(None)
    }

    async fn reclaim(&self, request: &CrawlRequest) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = &request.unique_key;

        let mut retried = request.clone();
        retried.retry_count += 1;
        state.requests.insert(key.clone(), retried);
        self.schedule(&mut state, key);

        Ok(())
    }

    async fn mark_completed(&self, unique_key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.requests.remove(unique_key);
        state.completed.insert(unique_key.to_string());
        Ok(())
    }

    async fn mark_failed(&self, unique_key: &str, error: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.requests.remove(unique_key);
        state.failed.insert(unique_key.to_string(), error.to_string());
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.state.lock().await;
        let pending = state.pending.len();

        Ok(QueueStats {
            pending,
            in_progress: state.requests.len().saturating_sub(pending),
            completed: state.completed.len(),
            failed: state.failed.len(),
            total: state.requests.len() + state.completed.len() + state.failed.len(),
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
