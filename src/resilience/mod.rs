//! 弹性模式模块：熔断器、限流器、重试策略以及把三者组合起来的保护服务。
//!
//! # Resilience
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | Per-provider closed/open/half-open failure isolation |
//! | [`rate_limiter`] | Per-caller fixed-window admission control |
//! | [`retry`] | Exponential backoff with full jitter |
//! | [`protection`] | Rate limit → breaker → retry loop around one outbound call |
//!
//! Breaker cells and rate-limit buckets are created on first use per key,
//! mutated only through atomic operations, and evicted by TTL. A breaker for
//! one provider never blocks another provider's admission, and a caller's
//! rate-limit check never waits on breaker activity.
//!
//! ```rust
//! use ai_lib_gateway::resilience::{Admission, RateLimiter, RateLimiterConfig};
//! use std::time::Duration;
//!
//! let limiter = RateLimiter::new();
//! let cfg = RateLimiterConfig::new(Duration::from_secs(60), 2);
//! assert!(matches!(limiter.try_acquire("caller-1", &cfg), Admission::Allowed { .. }));
//! assert!(matches!(limiter.try_acquire("caller-1", &cfg), Admission::Allowed { .. }));
//! assert!(matches!(limiter.try_acquire("caller-1", &cfg), Admission::Rejected { .. }));
//! ```

pub mod circuit_breaker;
pub mod protection;
pub mod rate_limiter;
pub mod retry;

use std::time::Instant;

use once_cell::sync::Lazy;

pub use circuit_breaker::{
    BreakerPermit, BreakerRejection, BreakerSnapshot, BreakerState, BreakerTransition, CircuitBreaker,
    CircuitBreakerConfig,
};
pub use protection::{PendingOutcome, ProtectionPolicy, ProtectionService, ProtectionTarget};
pub use rate_limiter::{Admission, RateLimitSnapshot, RateLimiter, RateLimiterConfig};
pub use retry::RetryPolicy;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds on a process-wide monotonic clock. Only differences are
/// meaningful.
pub(crate) fn monotonic_ms() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}
