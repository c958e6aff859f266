//! Elastic-expiry fixed-window rate limiter
//!
//! Each origin gets a counting window. Every accepted hit pushes the window's
//! expiry to `now + window`, so an origin that keeps sending stays inside one
//! window and is held to the budget, while an origin that goes quiet sees its
//! window lapse one full period after its last accepted request.
//!
//! Counters live in a `RateLimitStorage`: in-process (`MemoryStorage`) or
//! shared between nodes through Redis/DragonflyDB (`RedisStorage`).

use anyhow::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::config::RateLimitConfig;
use crate::lock_utils::lock_or_recover;

/// Counter storage for rate limit windows
#[async_trait]
pub trait RateLimitStorage: Send + Sync {
    /// Increment the counter for `key` and return the new count.
    ///
    /// A missing or expired window starts over at zero with expiry
    /// `now + window`.
    async fn incr(&self, key: &str, window: Duration) -> Result<u64>;

    /// Move the window expiry of `key` to `now + window`
    async fn extend(&self, key: &str, window: Duration) -> Result<()>;

    /// Time left in the window of `key`, if one is open
    async fn time_left(&self, key: &str) -> Result<Option<Duration>>;

    /// Drop expired windows; returns how many were removed
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
}

// =============================================================================
// MEMORY STORAGE
// =============================================================================

#[derive(Debug)]
struct Window {
    count: u64,
    expires_at: Instant,
}

impl Window {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-process window storage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    windows: Mutex<HashMap<String, Window>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracked_keys(&self) -> usize {
        lock_or_recover(&self.windows, "rate limit windows").len()
    }
}

#[async_trait]
impl RateLimitStorage for MemoryStorage {
    async fn incr(&self, key: &str, window: Duration) -> Result<u64> {
        let now = Instant::now();
        let mut windows = lock_or_recover(&self.windows, "rate limit windows");

        let entry = windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            expires_at: now + window,
        });
        if entry.is_expired(now) {
            entry.count = 0;
            entry.expires_at = now + window;
        }
        entry.count += 1;

        Ok(entry.count)
    }

    async fn extend(&self, key: &str, window: Duration) -> Result<()> {
        let now = Instant::now();
        let mut windows = lock_or_recover(&self.windows, "rate limit windows");
        if let Some(entry) = windows.get_mut(key) {
            entry.expires_at = now + window;
        }
        Ok(())
    }

    async fn time_left(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        let windows = lock_or_recover(&self.windows, "rate limit windows");
        Ok(windows
            .get(key)
            .filter(|w| !w.is_expired(now))
            .map(|w| w.expires_at - now))
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut windows = lock_or_recover(&self.windows, "rate limit windows");
        let before = windows.len();
        windows.retain(|_, w| !w.is_expired(now));
        Ok(before - windows.len())
    }
}

// =============================================================================
// REDIS STORAGE
// =============================================================================

/// Window storage shared through Redis/DragonflyDB
pub struct RedisStorage {
    connection: ConnectionManager,
}

impl RedisStorage {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self { connection })
    }
}

/// `MULTI; SET key 0 PX window NX; INCR key; EXEC`
///
/// A new window key gets its expiry in the same transaction as its first
/// increment, so no key is ever left without a TTL.
fn incr_pipeline(key: &str, window: Duration) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("SET")
        .arg(key)
        .arg(0u64)
        .arg("PX")
        .arg(window.as_millis() as u64)
        .arg("NX")
        .ignore()
        .cmd("INCR")
        .arg(key);
    pipe
}

#[async_trait]
impl RateLimitStorage for RedisStorage {
    async fn incr(&self, key: &str, window: Duration) -> Result<u64> {
        let mut conn = self.connection.clone();
        let (count,): (u64,) = incr_pipeline(key, window).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn extend(&self, key: &str, window: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        redis::cmd("PEXPIRE")
            .arg(key)
            .arg(window.as_millis() as u64)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn time_left(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.connection.clone();
        // -2: no key, -1: no expiry
        let ttl_ms: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(if ttl_ms > 0 {
            Some(Duration::from_millis(ttl_ms as u64))
        } else {
            None
        })
    }
}

// =============================================================================
// LIMITER
// =============================================================================

/// Rate limit decision
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitDecision {
    /// Request is allowed
    Allowed {
        /// Current request count in window
        current_count: u64,
        /// Remaining requests in window
        remaining: u64,
    },
    /// Request exceeds rate limit
    Denied {
        /// Current request count in window
        current_count: u64,
        /// Time until window resets (seconds)
        retry_after_secs: u64,
    },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

/// Per-origin elastic-expiry fixed-window limiter
pub struct ElasticWindowLimiter {
    storage: Arc<dyn RateLimitStorage>,
    budget: u64,
    window: Duration,
    enabled: bool,
}

impl ElasticWindowLimiter {
    pub fn new(storage: Arc<dyn RateLimitStorage>, budget: u64, window: Duration) -> Self {
        info!(
            "Creating elastic window rate limiter (window: {:?}, budget: {})",
            window, budget
        );
        Self {
            storage,
            budget,
            window,
            enabled: true,
        }
    }

    /// Limiter that accepts everything
    pub fn disabled() -> Self {
        Self {
            storage: Arc::new(MemoryStorage::new()),
            budget: u64::MAX,
            window: Duration::from_secs(1),
            enabled: false,
        }
    }

    /// Build from config, connecting to Redis when `redis_url` is set
    pub async fn from_config(config: &RateLimitConfig) -> Result<Self> {
        if !config.enabled {
            info!("Rate limiting disabled");
            return Ok(Self::disabled());
        }

        let storage: Arc<dyn RateLimitStorage> = match &config.redis_url {
            Some(url) => {
                info!("Rate limiter using Redis storage");
                Arc::new(RedisStorage::new(url).await?)
            }
            None => Arc::new(MemoryStorage::new()),
        };

        Ok(Self::new(
            storage,
            config.requests,
            Duration::from_secs(config.window_secs),
        ))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn key(origin: &str) -> String {
        format!("aegis:ratelimit:{}", origin)
    }

    /// Count one request from `origin`.
    ///
    /// Storage failures let the request through.
    pub async fn hit(&self, origin: &str) -> RateLimitDecision {
        if !self.enabled {
            return RateLimitDecision::Allowed {
                current_count: 0,
                remaining: self.budget,
            };
        }

        match self.try_hit(origin).await {
            Ok(decision) => decision,
            Err(e) => {
                error!("Rate limiter storage error for {}: {:#}", origin, e);
                RateLimitDecision::Allowed {
                    current_count: 0,
                    remaining: self.budget,
                }
            }
        }
    }

    async fn try_hit(&self, origin: &str) -> Result<RateLimitDecision> {
        let key = Self::key(origin);
        let count = self.storage.incr(&key, self.window).await?;

        if count <= self.budget {
            self.storage.extend(&key, self.window).await?;
            Ok(RateLimitDecision::Allowed {
                current_count: count,
                remaining: self.budget - count,
            })
        } else {
            let retry_after = self
                .storage
                .time_left(&key)
                .await?
                .unwrap_or(self.window);
            debug!("Rate limit exceeded for {} ({} > {})", origin, count, self.budget);
            Ok(RateLimitDecision::Denied {
                current_count: count,
                retry_after_secs: retry_after.as_secs().max(1),
            })
        }
    }

    /// Start background cleanup of expired windows
    pub fn spawn_purge_task(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        let period = self.window.saturating_mul(2).max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                match limiter.storage.purge_expired().await {
                    Ok(0) => {}
                    Ok(removed) => debug!("Purged {} expired rate limit windows", removed),
                    Err(e) => error!("Rate limit purge failed: {:#}", e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(budget: u64, window_secs: u64) -> (Arc<MemoryStorage>, ElasticWindowLimiter) {
        let storage = Arc::new(MemoryStorage::new());
        let limiter = ElasticWindowLimiter::new(
            storage.clone(),
            budget,
            Duration::from_secs(window_secs),
        );
        (storage, limiter)
    }

    #[test]
    fn test_redis_window_is_created_with_expiry_atomically() {
        let pipeline = incr_pipeline("rate:203.0.113.1", Duration::from_secs(60));
        let packed = pipeline.get_packed_pipeline();
        let packed = String::from_utf8(packed).unwrap();

        let position = |needle: &str| packed.find(needle).unwrap();
        assert!(position("MULTI") < position("SET"));
        assert!(position("SET") < position("INCR"));
        assert!(position("INCR") < position("EXEC"));
        assert!(packed.contains("\r\nPX\r\n"));
        assert!(packed.contains("\r\n60000\r\n"));
        assert!(packed.contains("\r\nNX\r\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_enforced_within_window() {
        let (_, limiter) = limiter(3, 10);

        for i in 1..=3 {
            let decision = limiter.hit("203.0.113.1").await;
            assert_eq!(
                decision,
                RateLimitDecision::Allowed {
                    current_count: i,
                    remaining: 3 - i
                }
            );
        }

        let decision = limiter.hit("203.0.113.1").await;
        assert!(!decision.is_allowed());
        match decision {
            RateLimitDecision::Denied { current_count, retry_after_secs } => {
                assert_eq!(current_count, 4);
                assert!(retry_after_secs >= 1 && retry_after_secs <= 10);
            }
            other => panic!("expected denial, got {:?}", other),
        }

        // Other origins are unaffected
        assert!(limiter.hit("203.0.113.2").await.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_origin_resets_after_window() {
        let (_, limiter) = limiter(2, 10);

        assert!(limiter.hit("a").await.is_allowed());
        assert!(limiter.hit("a").await.is_allowed());
        assert!(!limiter.hit("a").await.is_allowed());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(limiter.hit("a").await.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_origin_window_is_extended() {
        let (_, limiter) = limiter(3, 10);

        // Quiet origin: one hit at t=0, window lapses at t=10
        assert!(limiter.hit("quiet").await.is_allowed());

        // Active origin: accepted hits at t=0, t=6, t=12 keep pushing expiry
        assert!(limiter.hit("active").await.is_allowed());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(limiter.hit("active").await.is_allowed());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(limiter.hit("active").await.is_allowed());

        // t=12: a fixed window would have reset; the elastic one still counts
        assert!(!limiter.hit("active").await.is_allowed());

        // The quiet origin's window already expired and starts fresh
        assert_eq!(
            limiter.hit("quiet").await,
            RateLimitDecision::Allowed {
                current_count: 1,
                remaining: 2
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_hits_do_not_extend_window() {
        let (_, limiter) = limiter(1, 10);

        assert!(limiter.hit("x").await.is_allowed());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!limiter.hit("x").await.is_allowed());
        tokio::time::advance(Duration::from_secs(6)).await;

        // Expiry stayed at t=10 despite the rejected hit at t=5
        assert!(limiter.hit("x").await.is_allowed());
    }

    #[tokio::test]
    async fn test_disabled_limiter_allows_everything() {
        let limiter = ElasticWindowLimiter::disabled();
        assert!(!limiter.is_enabled());
        for _ in 0..1000 {
            assert!(limiter.hit("flood").await.is_allowed());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_windows() {
        let (storage, limiter) = limiter(5, 1);
        limiter.hit("a").await;
        limiter.hit("b").await;
        assert_eq!(storage.tracked_keys(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(storage.purge_expired().await.unwrap(), 2);
        assert_eq!(storage.tracked_keys(), 0);
    }
}
