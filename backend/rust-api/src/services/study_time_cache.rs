use std::collections::HashMap;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use tokio::sync::Mutex;

use crate::metrics::{record_cache_hit, record_cache_miss, record_cache_operation};

const CACHE_KEY_PREFIX: &str = "study_time:total:";
const GENERATION_KEY_PREFIX: &str = "study_time:gen:";
const GENERATION_TTL_SECONDS: i64 = 86_400;

/// Read-through cache for a user's lifetime study seconds.
///
/// Failures never reach the caller: a broken cache degrades to a store read.
///
/// Every invalidation bumps a per-user generation. A fill only lands when the
/// generation it read before loading from the store is still current, so a
/// total loaded before a fold can never be cached after it.
#[async_trait]
pub trait StudyTimeCache: Send + Sync {
    async fn get(&self, user_id: &str) -> Option<i64>;
    /// Current generation, or `None` when the cache cannot be read.
    async fn generation(&self, user_id: &str) -> Option<u64>;
    /// Stores the total if `generation` is still current. Returns whether it was stored.
    async fn set(&self, user_id: &str, total_seconds: i64, generation: u64) -> bool;
    async fn invalidate(&self, user_id: &str);
    async fn ping(&self) -> bool;
}

fn cache_key(user_id: &str) -> String {
    format!("{}{}", CACHE_KEY_PREFIX, user_id)
}

fn generation_key(user_id: &str) -> String {
    format!("{}{}", GENERATION_KEY_PREFIX, user_id)
}

#[derive(Clone)]
pub struct RedisStudyTimeCache {
    redis: ConnectionManager,
    ttl_seconds: u64,
}

impl RedisStudyTimeCache {
    pub fn new(redis: ConnectionManager, ttl_seconds: u64) -> Self {
        Self { redis, ttl_seconds }
    }
}

#[async_trait]
impl StudyTimeCache for RedisStudyTimeCache {
    async fn get(&self, user_id: &str) -> Option<i64> {
        let mut conn = self.redis.clone();
        let result: redis::RedisResult<Option<i64>> = conn.get(cache_key(user_id)).await;
        record_cache_operation("get", result.is_ok());

        match result {
            Ok(Some(total)) => {
                record_cache_hit();
                Some(total)
            }
            Ok(None) => {
                record_cache_miss();
                None
            }
            Err(e) => {
                tracing::warn!(user_id, error = %e, "study time cache read failed");
                None
            }
        }
    }

    async fn generation(&self, user_id: &str) -> Option<u64> {
        let mut conn = self.redis.clone();
        let result: redis::RedisResult<Option<u64>> = conn.get(generation_key(user_id)).await;
        record_cache_operation("get_generation", result.is_ok());
        match result {
            Ok(generation) => Some(generation.unwrap_or(0)),
            Err(e) => {
                tracing::warn!(user_id, error = %e, "study time cache generation read failed");
                None
            }
        }
    }

    async fn set(&self, user_id: &str, total_seconds: i64, generation: u64) -> bool {
        let mut conn = self.redis.clone();

        // Compare the generation and write in one step
        let lua_script = r#"
            local current = redis.call('GET', KEYS[2]) or '0'
            if current ~= ARGV[1] then
                return 0
            end
            redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
            return 1
        "#;

        let result: redis::RedisResult<u32> = redis::Script::new(lua_script)
            .key(cache_key(user_id))
            .key(generation_key(user_id))
            .arg(generation)
            .arg(total_seconds)
            .arg(self.ttl_seconds)
            .invoke_async(&mut conn)
            .await;
        record_cache_operation("setex", result.is_ok());

        match result {
            Ok(stored) => {
                if stored == 0 {
                    tracing::debug!(user_id, "study time cache fill superseded by invalidation");
                }
                stored == 1
            }
            Err(e) => {
                tracing::warn!(user_id, error = %e, "study time cache write failed");
                false
            }
        }
    }

    async fn invalidate(&self, user_id: &str) {
        let mut conn = self.redis.clone();
        let generation = generation_key(user_id);
        let result: redis::RedisResult<()> = redis::pipe()
            .atomic()
            .del(cache_key(user_id))
            .ignore()
            .incr(&generation, 1)
            .ignore()
            .expire(&generation, GENERATION_TTL_SECONDS)
            .ignore()
            .query_async(&mut conn)
            .await;
        record_cache_operation("del", result.is_ok());
        match result {
            Ok(()) => tracing::debug!(user_id, "study time cache invalidated"),
            Err(e) => tracing::warn!(user_id, error = %e, "study time cache invalidation failed"),
        }
    }

    async fn ping(&self) -> bool {
        let mut conn = self.redis.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }
}

/// Process-local cache without expiry, for tests and single-node development.
#[derive(Default)]
pub struct MemoryStudyTimeCache {
    entries: Mutex<HashMap<String, i64>>,
    generations: Mutex<HashMap<String, u64>>,
}

impl MemoryStudyTimeCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StudyTimeCache for MemoryStudyTimeCache {
    async fn get(&self, user_id: &str) -> Option<i64> {
        self.entries.lock().await.get(user_id).copied()
    }

    async fn generation(&self, user_id: &str) -> Option<u64> {
        Some(
            self.generations
                .lock()
                .await
                .get(user_id)
                .copied()
                .unwrap_or(0),
        )
    }

    async fn set(&self, user_id: &str, total_seconds: i64, generation: u64) -> bool {
        // Held across the write so an invalidation cannot slip in between.
        let generations = self.generations.lock().await;
        if generations.get(user_id).copied().unwrap_or(0) != generation {
            return false;
        }
        self.entries
            .lock()
            .await
            .insert(user_id.to_string(), total_seconds);
        true
    }

    async fn invalidate(&self, user_id: &str) {
        let mut generations = self.generations.lock().await;
        *generations.entry(user_id.to_string()).or_insert(0) += 1;
        self.entries.lock().await.remove(user_id);
    }

    async fn ping(&self) -> bool {
        true
    }
}
