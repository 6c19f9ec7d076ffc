//! Redis backend for [`KvStore`].
//!
//! Every call is bounded by the configured store timeout and reported to the
//! metrics sink. A timed-out call is a failure, never "key absent".

use super::{ttl_secs, KvStore, StoreError, WindowCount};
use crate::metrics::MetricsSink;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// INCR and start the window on the first increment, in one server-side step.
/// A counter found without a TTL gets one, so no counter can outlive its window.
const INCR_WINDOW_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('TTL', KEYS[1])
if ttl < 0 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
";

/// GET + DEL for single-use values.
const TAKE_SCRIPT: &str = r"
local val = redis.call('GET', KEYS[1])
if val then
    redis.call('DEL', KEYS[1])
end
return val
";

/// SET only if the current value still matches, keeping any TTL.
const COMPARE_AND_SET_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
    return 0
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl > 0 then
    redis.call('SET', KEYS[1], ARGV[2], 'PX', ttl)
else
    redis.call('SET', KEYS[1], ARGV[2])
end
return 1
";

#[derive(Clone)]
pub struct RedisStore {
    con: ConnectionManager,
    timeout: Duration,
    metrics: Arc<dyn MetricsSink>,
}

impl RedisStore {
    /// Connect to Redis. The connection manager reconnects on its own after
    /// transient failures.
    pub async fn connect(
        client: redis::Client,
        timeout: Duration,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, StoreError> {
        let con = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(timeout))??;
        Ok(Self {
            con,
            timeout,
            metrics,
        })
    }

    async fn run<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = Result<T, redis::RedisError>>,
    {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, f(self.con.clone())).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StoreError::from(e)),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        };
        self.metrics.store_call(op, started.elapsed(), result.is_ok());
        result
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.run("get", |mut con| async move { con.get(key).await })
            .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.run("set", |mut con| async move {
            con.set::<_, _, ()>(key, value).await
        })
        .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.run("set_ex", |mut con| async move {
            con.set_ex::<_, _, ()>(key, value, ttl_secs(ttl)).await
        })
        .await
    }

    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.run("set_nx", |mut con| async move {
            con.set_nx::<_, _, bool>(key, value).await
        })
        .await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        let swapped: i64 = self
            .run("compare_and_set", |mut con| async move {
                redis::Script::new(COMPARE_AND_SET_SCRIPT)
                    .key(key)
                    .arg(expected)
                    .arg(value)
                    .invoke_async(&mut con)
                    .await
            })
            .await?;
        Ok(swapped == 1)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.run("expire", |mut con| async move {
            con.expire::<_, bool>(key, ttl_secs(ttl) as i64).await
        })
        .await
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        self.run("del", |mut con| async move {
            let deleted: i64 = con.del(key).await?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn take(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.run("take", |mut con| async move {
            redis::Script::new(TAKE_SCRIPT)
                .key(key)
                .invoke_async(&mut con)
                .await
        })
        .await
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        let (count, ttl): (i64, i64) = self
            .run("incr_window", |mut con| async move {
                redis::Script::new(INCR_WINDOW_SCRIPT)
                    .key(key)
                    .arg(ttl_secs(window))
                    .invoke_async(&mut con)
                    .await
            })
            .await?;
        Ok(WindowCount {
            count: count.max(0) as u64,
            resets_in: Duration::from_secs(ttl.max(0) as u64),
        })
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<(), StoreError> {
        self.run("set_add", |mut con| async move {
            redis::pipe()
                .atomic()
                .sadd(key, member)
                .ignore()
                .expire(key, ttl_secs(ttl) as i64)
                .ignore()
                .query_async(&mut con)
                .await
        })
        .await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.run("set_remove", |mut con| async move {
            con.srem::<_, _, ()>(key, member).await
        })
        .await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.run("set_members", |mut con| async move { con.smembers(key).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CountingMetrics;

    // Note: these tests require a running Redis instance.
    // They are skipped if REDIS_URL is unreachable.
    async fn connect() -> Option<(RedisStore, Arc<CountingMetrics>)> {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let client = match redis::Client::open(redis_url) {
            Ok(c) => c,
            Err(_) => {
                eprintln!("Skipping test: Redis not available");
                return None;
            }
        };

        let metrics = Arc::new(CountingMetrics::new());
        match RedisStore::connect(client, Duration::from_secs(1), metrics.clone()).await {
            Ok(store) => Some((store, metrics)),
            Err(_) => {
                eprintln!("Skipping test: Redis connection failed");
                None
            }
        }
    }

    #[tokio::test]
    async fn test_incr_window_sets_expiry_once() {
        let Some((store, metrics)) = connect().await else {
            return;
        };
        let key = format!("test:ratelimit:{}", nanoid::nanoid!(8));

        let first = store.incr_window(&key, Duration::from_secs(60)).await.unwrap();
        assert_eq!(first.count, 1);
        assert!(first.resets_in <= Duration::from_secs(60));
        assert!(first.resets_in > Duration::ZERO);

        let second = store.incr_window(&key, Duration::from_secs(60)).await.unwrap();
        assert_eq!(second.count, 2);
        assert!(second.resets_in <= first.resets_in);

        assert_eq!(metrics.get("store.incr_window.ok"), 2);
        store.del(&key).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_incr_window_concurrent_no_lost_updates() {
        let Some((store, _metrics)) = connect().await else {
            return;
        };
        let key = format!("test:ratelimit:{}", nanoid::nanoid!(8));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store.incr_window(&key, Duration::from_secs(60)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let last = store.incr_window(&key, Duration::from_secs(60)).await.unwrap();
        assert_eq!(last.count, 21);
        store.del(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_compare_and_set_rejects_stale_value() {
        let Some((store, _metrics)) = connect().await else {
            return;
        };
        let key = format!("test:cas:{}", nanoid::nanoid!(8));

        store.set(&key, "a").await.unwrap();
        assert!(!store.compare_and_set(&key, "stale", "b").await.unwrap());
        assert!(store.compare_and_set(&key, "a", "b").await.unwrap());
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("b"));
        store.del(&key).await.unwrap();
        assert!(!store.compare_and_set(&key, "b", "c").await.unwrap());
    }

    #[tokio::test]
    async fn test_take_is_single_use() {
        let Some((store, _metrics)) = connect().await else {
            return;
        };
        let key = format!("test:take:{}", nanoid::nanoid!(8));

        store.set_ex(&key, "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.take(&key).await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.take(&key).await.unwrap(), None);
    }
}
