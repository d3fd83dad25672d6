pub mod kv;
pub mod memory;
pub mod object;
pub mod queue;
pub mod redis;
pub mod state;
pub mod strategy;

pub use kv::{KeyValueStore, MemoryKeyValueStore, RedisKeyValueStore};
pub use object::{FileObjectStore, ObjectStore};
pub use queue::{PersistentRequestQueue, QueueOperationInfo, QueueStats};
pub use state::{CrawlPhase, CrawlState, StatePersister};
