use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use redis::{aio::MultiplexedConnection, Client, Script};
use std::sync::Arc;
use tracing::{debug, info};

use crate::crawler::request::CrawlRequest;
use crate::storage::queue::{QueueBackend, QueueOperationInfo, QueueStats};
use crate::storage::strategy::QueueStrategy;

/// Check the finished sets, store the payload and schedule it in one step.
/// Returns 0 when the key is already known. Every key in KEYS gets the TTL.
const ADD_SCRIPT: &str = r#"
if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 1 then return 0 end
if redis.call('SISMEMBER', KEYS[3], ARGV[1]) == 1 then return 0 end
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 0 then return 0 end
redis.call('ZADD', KEYS[4], ARGV[3], ARGV[1])
for i = 1, #KEYS do redis.call('EXPIRE', KEYS[i], ARGV[4]) end
return 1
"#;

/// Pop the lowest scored key, mark it in progress and return its payload
const FETCH_SCRIPT: &str = r#"
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then return false end
redis.call('HSET', KEYS[3], popped[1], ARGV[1])
return redis.call('HGET', KEYS[2], popped[1])
"#;

/// Replace the payload and put the key back into `pending`
const RECLAIM_SCRIPT: &str = r#"
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
for i = 1, #KEYS do redis.call('EXPIRE', KEYS[i], ARGV[4]) end
return 1
"#;

/// Requeue a key left in progress, unless someone finished it meanwhile
const RECOVER_SCRIPT: &str = r#"
if redis.call('HDEL', KEYS[1], ARGV[1]) == 0 then return 0 end
if redis.call('HEXISTS', KEYS[2], ARGV[1]) == 0 then return 0 end
redis.call('ZADD', KEYS[3], ARGV[2], ARGV[1])
return 1
"#;

/// Queue backend shared across processes through Redis
pub struct RedisQueue {
    conn: MultiplexedConnection,
    strategy: Arc<dyn QueueStrategy>,
    /// Key prefix for this queue
    prefix: String,
    /// TTL for queue keys in seconds
    ttl: u64,
}

impl RedisQueue {
    pub async fn connect(
        redis_url: &str,
        queue_id: &str,
        ttl: u64,
        strategy: Arc<dyn QueueStrategy>,
    ) -> Result<Self> {
        let client = Client::open(redis_url)
            .context(format!("Failed to connect to Redis at {}", redis_url))?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to get Redis connection")?;

        debug!("Connected queue {} to Redis", queue_id);

        let queue = Self {
            conn,
            strategy,
            prefix: format!("crawler:queue:{}", queue_id),
            ttl,
        };

        let recovered = queue.recover_in_progress().await?;
        if recovered > 0 {
            info!("Requeued {} requests left in progress on queue {}", recovered, queue_id);
        }

        Ok(queue)
    }

    /// Put requests popped by a process that never finished them back into `pending`.
    ///
    /// Another live process sharing the queue may still be working on one of
    /// them, in which case it is handled twice.
    pub async fn recover_in_progress(&self) -> Result<usize> {
        let mut conn = self.conn.clone();

        let keys: Vec<String> = redis::cmd("HKEYS")
            .arg(self.key("in_progress"))
            .query_async(&mut conn)
            .await
            .context("Failed to list in-progress requests")?;

        let mut recovered = 0;
        for unique_key in keys {
            let index = self.next_index(&mut conn).await?;
            let requeued: i64 = Script::new(RECOVER_SCRIPT)
                .key(self.key("in_progress"))
                .key(self.key("requests"))
                .key(self.key("pending"))
                .arg(&unique_key)
                .arg(self.strategy.score(index))
                .invoke_async(&mut conn)
                .await
                .context("Failed to requeue in-progress request")?;
            if requeued == 1 {
                recovered += 1;
            }
        }

        Ok(recovered)
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    /// Reserve an insertion index. Indexes lost to duplicates only leave gaps.
    async fn next_index(&self, conn: &mut MultiplexedConnection) -> Result<u64> {
        redis::cmd("INCR")
            .arg(self.key("counter"))
            .query_async(conn)
            .await
            .context("Failed to reserve queue index")
    }

    async fn finish(&self, unique_key: &str, set: &str, error: Option<&str>) -> Result<()> {
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HDEL")
            .arg(self.key("requests"))
            .arg(unique_key)
            .ignore()
            .cmd("HDEL")
            .arg(self.key("in_progress"))
            .arg(unique_key)
            .ignore()
            .cmd("ZREM")
            .arg(self.key("pending"))
            .arg(unique_key)
            .ignore()
            .cmd("SADD")
            .arg(self.key(set))
            .arg(unique_key)
            .ignore();
        if let Some(error) = error {
            pipe.cmd("HSET").arg(self.key("errors")).arg(unique_key).arg(error).ignore();
        }
        pipe.cmd("PUBLISH")
            .arg(self.key("events"))
            .arg(format!("{}:{}", set, unique_key))
            .ignore();

        pipe.query_async::<_, ()>(&mut conn)
            .await
            .context(format!("Failed to move request to {} set", set))?;

        Ok(())
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn add(&self, request: &CrawlRequest) -> Result<QueueOperationInfo> {
        let payload = serde_json::to_string(request).context("Failed to serialize request")?;
        let mut conn = self.conn.clone();
        let index = self.next_index(&mut conn).await?;

        let added: i64 = Script::new(ADD_SCRIPT)
            .key(self.key("requests"))
            .key(self.key("completed"))
            .key(self.key("failed"))
            .key(self.key("pending"))
            .key(self.key("in_progress"))
            .key(self.key("counter"))
            .key(self.key("errors"))
            .arg(&request.unique_key)
            .arg(payload)
            .arg(self.strategy.score(index))
            .arg(self.ttl)
            .invoke_async(&mut conn)
            .await
            .context("Failed to add request to Redis queue")?;

        if added == 0 {
            return Ok(QueueOperationInfo {
                was_already_present: true,
                unique_key: request.unique_key.clone(),
            });
        }

        debug!("Pushed request to queue: {}", request.url);

        Ok(QueueOperationInfo {
            was_already_present: false,
            unique_key: request.unique_key.clone(),
        })
    }

    async fn fetch_next(&self) -> Result<Option<CrawlRequest>> {
        let mut conn = self.conn.clone();

        let payload: Option<String> = Script::new(FETCH_SCRIPT)
            .key(self.key("pending"))
            .key(self.key("requests"))
            .key(self.key("in_progress"))
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .context("Failed to pop request from Redis queue")?;

        match payload {
            Some(payload) => {
                let request: CrawlRequest =
                    serde_json::from_str(&payload).context("Failed to deserialize request")?;
                debug!("Popped request from queue: {}", request.url);
                Ok(Some(request))
            }
            None => Ok(None),
        }
    }

    async fn reclaim(&self, request: &CrawlRequest) -> Result<()> {
        let mut retried = request.clone();
        retried.retry_count += 1;
        let payload = serde_json::to_string(&retried).context("Failed to serialize request")?;
        let mut conn = self.conn.clone();
        let index = self.next_index(&mut conn).await?;

        Script::new(RECLAIM_SCRIPT)
            .key(self.key("requests"))
            .key(self.key("pending"))
            .key(self.key("in_progress"))
            .arg(&request.unique_key)
            .arg(payload)
            .arg(self.strategy.score(index))
            .arg(self.ttl)
            .invoke_async::<_, i64>(&mut conn)
            .await
            .context("Failed to requeue retried request")?;

        Ok(())
    }

    async fn mark_completed(&self, unique_key: &str) -> Result<()> {
        self.finish(unique_key, "completed", None).await
    }

    async fn mark_failed(&self, unique_key: &str, error: &str) -> Result<()> {
        self.finish(unique_key, "failed", Some(error)).await
    }

    async fn stats(&self) -> Result<QueueStats> {
        let mut conn = self.conn.clone();

        let (pending, in_progress, requests, completed, failed): (usize, usize, usize, usize, usize) = redis::pipe()
            .cmd("ZCARD")
            .arg(self.key("pending"))
            .cmd("HLEN")
            .arg(self.key("in_progress"))
            .cmd("HLEN")
            .arg(self.key("requests"))
            .cmd("SCARD")
            .arg(self.key("completed"))
            .cmd("SCARD")
            .arg(self.key("failed"))
            .query_async(&mut conn)
            .await
            .context("Failed to read queue statistics")?;

        Ok(QueueStats {
            pending,
            in_progress,
            completed,
            failed,
            total: requests + completed + failed,
        })
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
