use anyhow::Result;
use std::sync::Arc;

/// Maps an insertion index to a dequeue score; the lowest score is served first
pub trait QueueStrategy: Send + Sync {
    fn score(&self, index: u64) -> f64;

    fn name(&self) -> &'static str;
}

/// Breadth first: insertion order
#[derive(Debug, Clone, Copy, Default)]
pub struct BreadthFirst;

/// Depth first: newest request first
#[derive(Debug, Clone, Copy, Default)]
pub struct DepthFirst;

impl QueueStrategy for BreadthFirst {
    fn score(&self, index: u64) -> f64 {
        index as f64
    }

    fn name(&self) -> &'static str {
        "bfs"
    }
}

impl QueueStrategy for DepthFirst {
    fn score(&self, index: u64) -> f64 {
        -(index as f64)
    }

    fn name(&self) -> &'static str {
        "dfs"
    }
}

/// Resolve a strategy from its configured name
pub fn from_name(name: &str) -> Result<Arc<dyn QueueStrategy>> {
    match name.to_ascii_lowercase().as_str() {
        "bfs" | "breadth-first" => Ok(Arc::new(BreadthFirst)),
        "dfs" | "depth-first" => Ok(Arc::new(DepthFirst)),
        other => anyhow::bail!("Unsupported queue strategy: {}", other),
    }
}
