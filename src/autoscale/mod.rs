pub mod monitor;
pub mod pool;
pub mod snapshotter;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

pub use monitor::{MemorySampler, ProcMemorySampler, ResourceMonitor};
pub use pool::{AutoscaledPool, PoolCallbacks};
pub use snapshotter::Snapshotter;

/// Advisory load inputs for concurrency scaling
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LoadSignals: Send + Sync {
    /// Memory or runtime responsiveness is under pressure
    async fn is_overloaded(&self) -> bool;

    /// Clearly spare capacity over a longer window
    async fn is_underutilized(&self) -> bool;
}
