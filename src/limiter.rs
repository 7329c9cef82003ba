//! Fleet-wide task concurrency limiter.
//!
//! Two backends behind one trait: a redis sorted set of slot tokens scored
//! by wall-clock expiry (so a crashed holder's slot is reclaimable once its
//! TTL lapses), and an in-process semaphore for single-node deployments and
//! tests. Slots are keyed by token (the task's `text_id`) so the timeout
//! sweeper can release a slot it does not hold.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::Script;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout, Instant};

use crate::error::SynthError;

/// How often the redis backend re-tries a contended acquisition.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(500);

const SLOTS_KEY: &str = "vw:slots";

/// Bounds the number of concurrently running task engines.
#[async_trait]
pub trait ConcurrencyLimiter: Send + Sync {
    /// Try to obtain a slot for `token`, waiting up to `wait`. Returns
    /// `false` when the fleet is saturated for the whole window.
    async fn acquire(&self, token: &str, wait: Duration) -> Result<bool, SynthError>;

    /// Extend the TTL of a held slot. The engine calls this on a fixed
    /// cadence while the task runs.
    async fn renew(&self, token: &str) -> Result<(), SynthError>;

    /// Give the slot back. Safe to call for tokens that hold no slot.
    async fn release(&self, token: &str) -> Result<(), SynthError>;

    /// The configured ceiling. Always this accessor, never an internal
    /// counter read.
    fn capacity(&self) -> u32;

    /// Currently held (unexpired) slots.
    async fn in_flight(&self) -> Result<u32, SynthError>;
}

// ── Local fallback ─────────────────────────────────────────────────

/// In-process counting semaphore with per-token permit tracking.
pub struct LocalLimiter {
    capacity: u32,
    semaphore: Arc<Semaphore>,
    held: Mutex<HashMap<String, OwnedSemaphorePermit>>,
}

impl LocalLimiter {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
            held: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ConcurrencyLimiter for LocalLimiter {
    async fn acquire(&self, token: &str, wait: Duration) -> Result<bool, SynthError> {
        if self.held.lock().contains_key(token) {
            return Ok(true);
        }
        match timeout(wait, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => {
                self.held.lock().insert(token.to_string(), permit);
                Ok(true)
            }
            Ok(Err(_)) => Err(SynthError::Internal("limiter semaphore closed".into())),
            Err(_) => Ok(false),
        }
    }

    async fn renew(&self, _token: &str) -> Result<(), SynthError> {
        // Local permits cannot leak across processes; nothing to refresh.
        Ok(())
    }

    async fn release(&self, token: &str) -> Result<(), SynthError> {
        self.held.lock().remove(token);
        Ok(())
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    async fn in_flight(&self) -> Result<u32, SynthError> {
        Ok(self.held.lock().len() as u32)
    }
}

// ── Shared backend ─────────────────────────────────────────────────

/// Cross-process limiter over a redis sorted set. Acquisition is a single
/// script: purge expired slots, then compare-and-set against the limit.
pub struct RedisLimiter {
    conn: MultiplexedConnection,
    capacity: u32,
    slot_ttl: Duration,
    acquire_script: Script,
}

impl RedisLimiter {
    pub fn new(conn: MultiplexedConnection, capacity: u32, slot_ttl: Duration) -> Self {
        let acquire_script = Script::new(
            r"
            redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[2])
            if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
              redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
              return 1
            end
            if redis.call('ZCARD', KEYS[1]) < tonumber(ARGV[4]) then
              redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
              return 1
            end
            return 0
            ",
        );
        Self {
            conn,
            capacity,
            slot_ttl,
            acquire_script,
        }
    }

    async fn try_acquire(&self, token: &str) -> Result<bool, SynthError> {
        let now_ms = Utc::now().timestamp_millis();
        let expiry_ms = now_ms + self.slot_ttl.as_millis() as i64;
        let mut conn = self.conn.clone();
        let granted: i32 = self
            .acquire_script
            .key(SLOTS_KEY)
            .arg(token)
            .arg(now_ms)
            .arg(expiry_ms)
            .arg(self.capacity)
            .invoke_async(&mut conn)
            .await?;
        Ok(granted == 1)
    }
}

#[async_trait]
impl ConcurrencyLimiter for RedisLimiter {
    async fn acquire(&self, token: &str, wait: Duration) -> Result<bool, SynthError> {
        let deadline = Instant::now() + wait;
        loop {
            if self.try_acquire(token).await? {
                return Ok(true);
            }
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => return Ok(false),
            };
            sleep(ACQUIRE_POLL_INTERVAL.min(remaining)).await;
        }
    }

    async fn renew(&self, token: &str) -> Result<(), SynthError> {
        let expiry_ms = Utc::now().timestamp_millis() + self.slot_ttl.as_millis() as i64;
        let mut conn = self.conn.clone();
        // XX: refresh only if the slot still exists; a reclaimed slot must
        // not be resurrected by a stale holder.
        let _: i64 = redis::cmd("ZADD")
            .arg(SLOTS_KEY)
            .arg("XX")
            .arg("CH")
            .arg(expiry_ms)
            .arg(token)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn release(&self, token: &str) -> Result<(), SynthError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZREM")
            .arg(SLOTS_KEY)
            .arg(token)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    async fn in_flight(&self) -> Result<u32, SynthError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(SLOTS_KEY)
            .arg("-inf")
            .arg(now_ms)
            .query_async(&mut conn)
            .await?;
        let count: i64 = redis::cmd("ZCARD")
            .arg(SLOTS_KEY)
            .query_async(&mut conn)
            .await?;
        Ok(count as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn ceiling_is_enforced() {
        let limiter = LocalLimiter::new(2);
        assert!(limiter.acquire("t1", SHORT).await.unwrap());
        assert!(limiter.acquire("t2", SHORT).await.unwrap());
        assert!(!limiter.acquire("t3", SHORT).await.unwrap());
        assert_eq!(limiter.in_flight().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn release_frees_a_slot() {
        let limiter = LocalLimiter::new(1);
        assert!(limiter.acquire("t1", SHORT).await.unwrap());
        assert!(!limiter.acquire("t2", SHORT).await.unwrap());
        limiter.release("t1").await.unwrap();
        assert!(limiter.acquire("t2", SHORT).await.unwrap());
    }

    #[tokio::test]
    async fn release_of_unknown_token_is_a_noop() {
        let limiter = LocalLimiter::new(1);
        limiter.release("ghost").await.unwrap();
        assert_eq!(limiter.in_flight().await.unwrap(), 0);
        assert!(limiter.acquire("t1", SHORT).await.unwrap());
    }

    #[tokio::test]
    async fn reacquiring_a_held_token_does_not_double_count() {
        let limiter = LocalLimiter::new(1);
        assert!(limiter.acquire("t1", SHORT).await.unwrap());
        assert!(limiter.acquire("t1", SHORT).await.unwrap());
        assert_eq!(limiter.in_flight().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn capacity_reports_configured_limit() {
        let limiter = LocalLimiter::new(7);
        assert_eq!(limiter.capacity(), 7);
        // Acquisitions must not change the reported capacity.
        assert!(limiter.acquire("t1", SHORT).await.unwrap());
        assert_eq!(limiter.capacity(), 7);
    }
}
