use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use super::monotonic_ms;

/// Largest per-window limit; the count shares one atomic word with the
/// window start.
pub const MAX_LIMIT: u32 = (1 << COUNT_BITS) - 1;

const COUNT_BITS: u32 = 24;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    pub window: Duration,
    pub max: u32,
}

impl RateLimiterConfig {
    pub fn new(window: Duration, max: u32) -> Self {
        Self {
            window,
            max: max.min(MAX_LIMIT),
        }
    }

    fn window_ms(&self) -> u64 {
        (self.window.as_millis() as u64).max(1)
    }
}

/// Outcome of [`RateLimiter::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed { remaining: u32 },
    Rejected { retry_after_ms: u64 },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    pub caller_key: String,
    pub window_ms: u64,
    pub limit: u32,
    /// Admissions counted in the current window.
    pub count: u32,
    /// Time until the current window rolls over, if one is active.
    pub window_remaining_ms: Option<u64>,
}

fn pack(window_start_ms: u64, count: u32) -> u64 {
    (window_start_ms << COUNT_BITS) | (count as u64 & COUNT_MASK)
}

fn unpack(word: u64) -> (u64, u32) {
    (word >> COUNT_BITS, (word & COUNT_MASK) as u32)
}

#[derive(Debug)]
struct Bucket {
    /// `window_start_ms << 24 | count`
    state: AtomicU64,
    window_ms: AtomicU64,
    limit: AtomicU64,
    last_used_ms: AtomicU64,
}

impl Bucket {
    fn new(now: u64, cfg: &RateLimiterConfig) -> Self {
        Self {
            state: AtomicU64::new(pack(now, 0)),
            window_ms: AtomicU64::new(cfg.window_ms()),
            limit: AtomicU64::new(cfg.max as u64),
            last_used_ms: AtomicU64::new(now),
        }
    }

    fn try_acquire(&self, now: u64, cfg: &RateLimiterConfig) -> Admission {
        let window_ms = cfg.window_ms();
        self.window_ms.store(window_ms, Ordering::Relaxed);
        self.limit.store(cfg.max as u64, Ordering::Relaxed);
        self.last_used_ms.store(now, Ordering::Relaxed);

        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let (mut start, mut count) = unpack(current);
            if now.saturating_sub(start) >= window_ms {
                start = now;
                count = 0;
            }
            if count >= cfg.max {
                let elapsed = now.saturating_sub(start);
                return Admission::Rejected {
                    retry_after_ms: window_ms.saturating_sub(elapsed).max(1),
                };
            }
            match self.state.compare_exchange_weak(
                current,
                pack(start, count + 1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Admission::Allowed {
                        remaining: cfg.max - count - 1,
                    }
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// Per-caller fixed-window rate limiter.
///
/// The window resets once `now - window_start >= window`, so a caller can get
/// up to twice the limit across a window boundary. Window and limit come from
/// the config passed with each call; buckets are keyed by caller key only.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: DashMap<String, Arc<Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&self, key: &str, now: u64, cfg: &RateLimiterConfig) -> Arc<Bucket> {
        if let Some(b) = self.buckets.get(key) {
            return Arc::clone(b.value());
        }
        Arc::clone(
            self.buckets
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Bucket::new(now, cfg)))
                .value(),
        )
    }

    /// Count one request against `key`'s window.
    pub fn try_acquire(&self, key: &str, cfg: &RateLimiterConfig) -> Admission {
        let now = monotonic_ms();
        self.bucket(key, now, cfg).try_acquire(now, cfg)
    }

    pub fn snapshot(&self, key: &str) -> Option<RateLimitSnapshot> {
        let now = monotonic_ms();
        let bucket = self.buckets.get(key)?;
        let (start, count) = unpack(bucket.state.load(Ordering::Acquire));
        let window_ms = bucket.window_ms.load(Ordering::Relaxed);
        let elapsed = now.saturating_sub(start);
        let active = elapsed < window_ms;
        Some(RateLimitSnapshot {
            caller_key: key.to_string(),
            window_ms,
            limit: bucket.limit.load(Ordering::Relaxed) as u32,
            count: if active { count } else { 0 },
            window_remaining_ms: active.then(|| window_ms - elapsed),
        })
    }

    /// Drop buckets whose window has expired and that saw no request for
    /// `ttl`. Returns how many went.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let now = monotonic_ms();
        let ttl_ms = ttl.as_millis() as u64;
        let before = self.buckets.len();
        self.buckets.retain(|_, b| {
            let (start, _) = unpack(b.state.load(Ordering::Acquire));
            let expired = now.saturating_sub(start) >= b.window_ms.load(Ordering::Relaxed);
            let idle = now.saturating_sub(b.last_used_ms.load(Ordering::Relaxed)) >= ttl_ms;
            !(expired && idle)
        });
        before.saturating_sub(self.buckets.len())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
