use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::Utc;
use common::error::{AppError, Res};
use redis::AsyncCommands;

/// Fast counter store for short-window rate limiting.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current value, 0 when missing.
    async fn get(&self, key: &str) -> Res<i64>;

    /// Increments and (re)sets the TTL in one atomic step.
    async fn incr_expire(&self, key: &str, by: i64, ttl: Duration) -> Res<i64>;
}

pub struct RedisCounter {
    pool: deadpool_redis::Pool,
}

impl RedisCounter {
    pub fn new(pool: deadpool_redis::Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CounterStore for RedisCounter {
    async fn get(&self, key: &str) -> Res<i64> {
        let mut conn = self.pool.get().await?;
        let value: Option<i64> = conn.get(key).await?;
        Ok(value.unwrap_or(0))
    }

    async fn incr_expire(&self, key: &str, by: i64, ttl: Duration) -> Res<i64> {
        let mut conn = self.pool.get().await?;
        let (value,): (i64,) = redis::pipe()
            .atomic()
            .incr(key, by)
            .expire(key, ttl.as_secs().max(1) as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }
}

/// In-process [`CounterStore`]; expired entries read as zero.
#[derive(Default)]
pub struct MemoryCounter {
    values: Mutex<HashMap<String, (i64, Instant)>>,
}

impl MemoryCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Res<std::sync::MutexGuard<'_, HashMap<String, (i64, Instant)>>> {
        self.values
            .lock()
            .map_err(|_| AppError::Internal("counter lock poisoned".to_string()))
    }
}

#[async_trait]
impl CounterStore for MemoryCounter {
    async fn get(&self, key: &str) -> Res<i64> {
        let now = Instant::now();
        Ok(self
            .lock()?
            .get(key)
            .filter(|(_, expires)| *expires > now)
            .map(|(v, _)| *v)
            .unwrap_or(0))
    }

    async fn incr_expire(&self, key: &str, by: i64, ttl: Duration) -> Res<i64> {
        let now = Instant::now();
        let mut values = self.lock()?;
        values.retain(|_, (_, expires)| *expires > now);
        let entry = values.entry(key.to_string()).or_insert((0, now));
        entry.0 += by;
        entry.1 = now + ttl;
        Ok(entry.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Calls left in the current window after this one.
    pub remaining: i64,
    /// Seconds until the window rolls over, set on rejection.
    pub retry_after: Option<u64>,
}

/// Fixed-window request counter. Concurrent callers may overshoot by the
/// number of requests racing within one window.
#[derive(Clone)]
pub struct RateLimiter {
    counter: std::sync::Arc<dyn CounterStore>,
    window: Duration,
}

impl RateLimiter {
    pub fn new(counter: std::sync::Arc<dyn CounterStore>, window: Duration) -> Self {
        Self {
            counter,
            window: window.max(Duration::from_secs(1)),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub async fn validate(&self, key: &str, limit: i64, cost: i64) -> Res<RateDecision> {
        self.validate_at(key, limit, cost, Utc::now().timestamp()).await
    }

    /// Same as [`RateLimiter::validate`] at unix time `now`.
    pub async fn validate_at(&self, key: &str, limit: i64, cost: i64, now: i64) -> Res<RateDecision> {
        let window = self.window.as_secs() as i64;
        let at = now.div_euclid(window);
        let counter_key = format!("{}:{}", key, at);

        let value = self.counter.get(&counter_key).await?;
        if value + cost > limit {
            return Ok(RateDecision {
                allowed: false,
                remaining: (limit - value).max(0),
                retry_after: Some(((at + 1) * window - now).max(1) as u64),
            });
        }

        let value = self.counter.incr_expire(&counter_key, cost, self.window).await?;
        Ok(RateDecision {
            allowed: true,
            remaining: (limit - value).max(0),
            retry_after: None,
        })
    }
}
