//! 保护服务：限流 → 熔断 → 重试循环，决定一次上游调用是否发起、重试或拒绝。

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{
    Admission, BreakerPermit, BreakerTransition, CircuitBreaker, CircuitBreakerConfig, RateLimiter,
    RateLimiterConfig, RetryPolicy,
};
use crate::telemetry::{ProtectionObserver, RetryAttemptRecord, TracingObserver};
use crate::types::ProviderIdentity;
use crate::{Error, Result};

/// Limits applied to calls against one provider.
#[derive(Debug, Clone)]
pub struct ProtectionPolicy {
    pub breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimiterConfig,
    pub retry: RetryPolicy,
}

/// Who is calling whom, under which limits.
#[derive(Debug, Clone)]
pub struct ProtectionTarget {
    pub identity: ProviderIdentity,
    pub caller_key: String,
    pub policy: ProtectionPolicy,
}

/// The only component that decides whether an outbound call is attempted,
/// retried or rejected.
///
/// Order per call: the caller's rate limit first (a saturated caller never
/// touches the breaker), then the provider's breaker (an open breaker never
/// makes a network attempt), then the attempt itself. The breaker is checked
/// again before every retry, since other calls may have opened it meanwhile.
/// Rate-limit quota is not refunded when the breaker rejects.
#[derive(Clone)]
pub struct ProtectionService {
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    observer: Arc<dyn ProtectionObserver>,
}

impl std::fmt::Debug for ProtectionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectionService")
            .field("breakers", &self.breaker.len())
            .field("buckets", &self.limiter.len())
            .finish()
    }
}

impl Default for ProtectionService {
    fn default() -> Self {
        Self::new(
            Arc::new(CircuitBreaker::new()),
            Arc::new(RateLimiter::new()),
            Arc::new(TracingObserver),
        )
    }
}

impl ProtectionService {
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<RateLimiter>,
        observer: Arc<dyn ProtectionObserver>,
    ) -> Self {
        Self {
            breaker,
            limiter,
            observer,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    fn report(&self, identity: &ProviderIdentity, transition: Option<BreakerTransition>) {
        if let Some(t) = transition {
            self.observer.on_breaker_transition(identity, t);
        }
    }

    /// Run `operation` under the target's protection. `operation` receives the
    /// zero-based attempt number and is invoked once per attempt.
    ///
    /// Retryable failures are retried until the policy is exhausted, then the
    /// last error is returned unchanged. The breaker sees one outcome per
    /// call: a success, or the failure that ended the call. A failed
    /// half-open probe is the exception and re-opens the breaker at once.
    /// Local failures and cancellation never count. Cancelling `cancel`
    /// aborts the current attempt or backoff sleep and returns
    /// `Error::Cancelled`.
    pub async fn execute<T, F, Fut>(
        &self,
        target: &ProtectionTarget,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (value, pending) = self.execute_pending(target, cancel, operation).await?;
        pending.succeed();
        Ok(value)
    }

    /// Like [`execute`](Self::execute), but a successful call leaves its
    /// breaker outcome open. Streams use this so the provider only counts as
    /// healthy once the stream has finished.
    pub async fn execute_pending<T, F, Fut>(
        &self,
        target: &ProtectionTarget,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<(T, PendingOutcome)>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if let Admission::Rejected { retry_after_ms } = self
            .limiter
            .try_acquire(&target.caller_key, &target.policy.rate_limit)
        {
            self.observer
                .on_rate_limited(&target.caller_key, retry_after_ms);
            return Err(Error::RateLimited {
                caller_key: target.caller_key.clone(),
                retry_after_ms,
            });
        }

        let identity = &target.identity;
        let retry = &target.policy.retry;
        let mut attempt: u32 = 0;
        loop {
            let permit = match self.breaker.admit(identity, &target.policy.breaker) {
                Ok((permit, transition)) => {
                    self.report(identity, transition);
                    permit
                }
                Err(rejection) => {
                    self.report(identity, rejection.transition);
                    self.observer
                        .on_unavailable(identity, rejection.retry_after_ms);
                    return Err(Error::Unavailable {
                        identity: identity.clone(),
                        retry_after_ms: rejection.retry_after_ms,
                    });
                }
            };

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                r = operation(attempt) => r,
            };

            let err = match outcome {
                Ok(value) => {
                    let pending = PendingOutcome {
                        service: self.clone(),
                        identity: identity.clone(),
                        permit,
                    };
                    return Ok((value, pending));
                }
                Err(err) => err,
            };

            let retrying = retry.should_retry(&err, attempt);
            if err.is_provider_fault() && (!retrying || permit.is_probe()) {
                self.report(identity, permit.fail());
            } else {
                // a probe permit frees its slot without an outcome
                drop(permit);
            }

            if !retrying {
                return Err(err);
            }

            let delay = retry.delay_for(&err, attempt);
            self.observer.on_retry(&RetryAttemptRecord {
                identity: identity.clone(),
                attempt_number: attempt + 1,
                delay_ms: delay.as_millis() as u64,
                cause: err.to_string(),
                cause_kind: err.kind(),
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

/// Breaker outcome of a call that returned but whose result is only known
/// later. Dropping it unresolved records nothing and frees a half-open probe
/// slot.
#[derive(Debug)]
#[must_use = "an unresolved outcome is never reported to the breaker"]
pub struct PendingOutcome {
    service: ProtectionService,
    identity: ProviderIdentity,
    permit: BreakerPermit,
}

impl PendingOutcome {
    pub fn succeed(self) {
        let transition = self.permit.succeed();
        self.service.report(&self.identity, transition);
    }

    pub fn fail(self) {
        let transition = self.permit.fail();
        self.service.report(&self.identity, transition);
    }
}
