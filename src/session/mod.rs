//! 会话协调器：保证每个会话同一时刻最多只有一个进行中的请求。
//!
//! Per-conversation exclusivity.
//!
//! A conversation holds at most one lease at a time. A second turn for a
//! conversation that already has one in flight is refused with
//! `Error::SessionBusy` immediately; there is no queue. Every lease carries a
//! hard timeout independent of the caller's own: when it fires the turn's
//! cancellation token is cancelled, and after a grace period the turn is
//! dropped. A lease older than timeout plus grace is considered abandoned and
//! may be reclaimed by the next turn.
//!
//! The lease is released on every exit path (success, error, cancellation,
//! panic) by a drop guard that only releases its own lease.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::resilience::monotonic_ms;
use crate::{Error, Result};

pub const DEFAULT_HARD_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_LEASE_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
struct Lease {
    id: u64,
    held_since_ms: u64,
}

#[derive(Debug, Default)]
struct SessionEntry {
    lease: Option<Lease>,
    provider_session_id: Option<String>,
}

type Entries = Arc<DashMap<String, SessionEntry>>;

/// What the lease holder gets to work with.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    conversation_id: String,
    lease_id: u64,
    cancel: CancellationToken,
    provider_session_id: Option<String>,
    entries: Entries,
    hard_timeout: Duration,
    timed_out: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Cancelled when the caller cancels or the hard timeout fires.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the hard timeout, rather than the caller, cancelled the turn.
    pub fn hit_hard_timeout(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    /// Why the turn's token was cancelled: `UpstreamTimeout` after the hard
    /// timeout, `Cancelled` otherwise.
    pub fn interruption_cause(&self) -> Error {
        if self.hit_hard_timeout() {
            hard_timeout_error(self.hard_timeout)
        } else {
            Error::Cancelled
        }
    }

    /// Provider-side session bound by an earlier turn.
    pub fn provider_session_id(&self) -> Option<&str> {
        self.provider_session_id.as_deref()
    }

    /// Record the provider-side session id for later turns. Ignored once the
    /// lease has been lost.
    pub fn bind_provider_session(&self, provider_session_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(&self.conversation_id) {
            if entry.lease.map(|l| l.id) == Some(self.lease_id) {
                if entry.provider_session_id.as_deref() != Some(provider_session_id) {
                    tracing::debug!(
                        conversation_id = %self.conversation_id,
                        provider_session_id = %provider_session_id,
                        "bound provider session"
                    );
                }
                entry.provider_session_id = Some(provider_session_id.to_string());
            }
        }
    }
}

/// Releases the lease it was created for, and only that lease.
struct LeaseGuard {
    entries: Entries,
    conversation_id: String,
    lease_id: u64,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(mut entry) = self.entries.get_mut(&self.conversation_id) {
            if entry.lease.map(|l| l.id) == Some(self.lease_id) {
                entry.lease = None;
            }
        }
    }
}

fn hard_timeout_error(hard_timeout: Duration) -> Error {
    Error::UpstreamTimeout {
        message: format!(
            "turn exceeded the session hard timeout of {}ms",
            hard_timeout.as_millis()
        ),
    }
}

#[derive(Debug)]
pub struct SessionCoordinator {
    entries: Entries,
    hard_timeout: Duration,
    lease_grace: Duration,
    next_lease: AtomicU64,
}

impl Default for SessionCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_HARD_TIMEOUT, DEFAULT_LEASE_GRACE)
    }
}

impl SessionCoordinator {
    pub fn new(hard_timeout: Duration, lease_grace: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            hard_timeout,
            lease_grace,
            next_lease: AtomicU64::new(1),
        }
    }

    fn acquire(&self, conversation_id: &str) -> Result<(LeaseGuard, Option<String>)> {
        let now = monotonic_ms();
        let stale_after = (self.hard_timeout + self.lease_grace).as_millis() as u64;
        let lease_id = self.next_lease.fetch_add(1, Ordering::Relaxed);

        let mut entry = self.entries.entry(conversation_id.to_string()).or_default();
        if let Some(held) = entry.lease {
            let age = now.saturating_sub(held.held_since_ms);
            if age < stale_after {
                return Err(Error::SessionBusy {
                    conversation_id: conversation_id.to_string(),
                });
            }
            tracing::warn!(
                conversation_id = %conversation_id,
                held_ms = age,
                "reclaiming abandoned session lease"
            );
        }
        entry.lease = Some(Lease {
            id: lease_id,
            held_since_ms: now,
        });
        let provider_session_id = entry.provider_session_id.clone();
        drop(entry);

        Ok((
            LeaseGuard {
                entries: Arc::clone(&self.entries),
                conversation_id: conversation_id.to_string(),
                lease_id,
            },
            provider_session_id,
        ))
    }

    /// Run `f` while holding `conversation_id`'s lease.
    ///
    /// Returns `Error::SessionBusy` without calling `f` if another turn holds
    /// the lease. The handle's token is a child of `cancel`.
    pub async fn with_lock<T, F, Fut>(
        &self,
        conversation_id: &str,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(SessionHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (guard, provider_session_id) = self.acquire(conversation_id)?;
        let token = cancel.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));
        let handle = SessionHandle {
            conversation_id: conversation_id.to_string(),
            lease_id: guard.lease_id,
            cancel: token.clone(),
            provider_session_id,
            entries: Arc::clone(&self.entries),
            hard_timeout: self.hard_timeout,
            timed_out: Arc::clone(&timed_out),
        };

        let fut = f(handle);
        tokio::pin!(fut);
        let deadline = tokio::time::sleep(self.hard_timeout);
        tokio::pin!(deadline);

        let result = tokio::select! {
            r = &mut fut => r,
            _ = &mut deadline => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    timeout_ms = self.hard_timeout.as_millis() as u64,
                    "session hard timeout, cancelling turn"
                );
                timed_out.store(true, Ordering::Release);
                token.cancel();
                // let the turn wind down and report its partial outcome
                match tokio::time::timeout(self.lease_grace, &mut fut).await {
                    Ok(r) => r,
                    Err(_) => Err(hard_timeout_error(self.hard_timeout)),
                }
            }
        };
        drop(guard);
        result
    }

    pub fn is_locked(&self, conversation_id: &str) -> bool {
        self.entries
            .get(conversation_id)
            .map(|e| e.lease.is_some())
            .unwrap_or(false)
    }

    pub fn provider_session_id(&self, conversation_id: &str) -> Option<String> {
        self.entries
            .get(conversation_id)
            .and_then(|e| e.provider_session_id.clone())
    }

    /// Destroy the record of a deleted conversation. Returns whether one existed.
    pub fn forget(&self, conversation_id: &str) -> bool {
        self.entries.remove(conversation_id).is_some()
    }

    /// Drop records that hold neither a lease nor a provider session.
    pub fn evict_idle(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| e.lease.is_some() || e.provider_session_id.is_some());
        before.saturating_sub(self.entries.len())
    }

    pub fn active_leases(&self) -> usize {
        self.entries.iter().filter(|e| e.lease.is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
