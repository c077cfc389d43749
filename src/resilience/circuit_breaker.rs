use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use super::monotonic_ms;
use crate::types::ProviderIdentity;

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the cooldown duration
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

impl BreakerState {
    fn from_u8(v: u8) -> Self {
        match v {
            OPEN => BreakerState::Open,
            HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

/// A state change, reported to whoever caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerTransition {
    pub from: BreakerState,
    pub to: BreakerState,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub identity: ProviderIdentity,
    pub state: BreakerState,
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub consecutive_failures: u32,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
    pub half_open_probe_in_flight: bool,
}

/// Lock-free state of one provider's breaker.
#[derive(Debug)]
struct BreakerCell {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    opened_at_ms: AtomicU64,
    half_open_probes: AtomicU32,
    failure_threshold: AtomicU32,
    cooldown_ms: AtomicU64,
    last_used_ms: AtomicU64,
}

impl BreakerCell {
    fn new(cfg: &CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(CLOSED),
            consecutive_failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            half_open_probes: AtomicU32::new(0),
            failure_threshold: AtomicU32::new(cfg.failure_threshold.max(1)),
            cooldown_ms: AtomicU64::new(cfg.cooldown.as_millis() as u64),
            last_used_ms: AtomicU64::new(monotonic_ms()),
        }
    }

    fn apply(&self, cfg: &CircuitBreakerConfig) {
        self.failure_threshold
            .store(cfg.failure_threshold.max(1), Ordering::Release);
        self.cooldown_ms
            .store(cfg.cooldown.as_millis() as u64, Ordering::Release);
    }

    fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: u8, to: u8) -> Option<BreakerTransition> {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BreakerTransition {
                from: BreakerState::from_u8(from),
                to: BreakerState::from_u8(to),
            })
    }

    fn open_remaining_ms(&self, now: u64) -> u64 {
        let opened_at = self.opened_at_ms.load(Ordering::Acquire);
        let cooldown = self.cooldown_ms.load(Ordering::Acquire);
        cooldown.saturating_sub(now.saturating_sub(opened_at))
    }

    /// Decide admission. In HalfOpen exactly one caller wins the probe slot
    /// through a CAS on `half_open_probes`.
    fn decide(&self, now: u64) -> (Decision, Option<BreakerTransition>) {
        self.last_used_ms.store(now, Ordering::Release);
        let mut transition = None;
        match self.state.load(Ordering::Acquire) {
            CLOSED => return (Decision::Allowed { probe: false }, None),
            OPEN => {
                let remaining = self.open_remaining_ms(now);
                if remaining > 0 {
                    return (
                        Decision::Rejected {
                            retry_after_ms: Some(remaining),
                        },
                        None,
                    );
                }
                // Losers of this CAS fall through and race for the probe slot.
                transition = self.transition(OPEN, HALF_OPEN);
            }
            _ => {}
        }

        if self.state.load(Ordering::Acquire) != HALF_OPEN {
            // Re-opened or closed between the loads; decide again from scratch
            // on the caller's next attempt.
            return match self.state() {
                BreakerState::Closed => (Decision::Allowed { probe: false }, transition),
                _ => (
                    Decision::Rejected {
                        retry_after_ms: Some(self.open_remaining_ms(now)),
                    },
                    transition,
                ),
            };
        }

        match self
            .half_open_probes
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => (Decision::Allowed { probe: true }, transition),
            Err(_) => (
                Decision::Rejected {
                    retry_after_ms: None,
                },
                transition,
            ),
        }
    }

    fn on_success(&self) -> Option<BreakerTransition> {
        self.consecutive_failures.store(0, Ordering::Release);
        let transition = self.transition(HALF_OPEN, CLOSED);
        if transition.is_some() {
            self.half_open_probes.store(0, Ordering::Release);
        }
        transition
    }

    fn on_failure(&self, now: u64) -> Option<BreakerTransition> {
        let failures = self
            .consecutive_failures
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);
        match self.state.load(Ordering::Acquire) {
            CLOSED if failures >= self.failure_threshold.load(Ordering::Acquire) => {
                // opened_at must be visible before anyone observes Open
                self.opened_at_ms.store(now, Ordering::Release);
                self.transition(CLOSED, OPEN)
            }
            HALF_OPEN => {
                self.opened_at_ms.store(now, Ordering::Release);
                let transition = self.transition(HALF_OPEN, OPEN);
                if transition.is_some() {
                    self.half_open_probes.store(0, Ordering::Release);
                }
                transition
            }
            // late failures of calls admitted before the breaker opened
            _ => None,
        }
    }

    fn release_probe(&self) {
        if self.state.load(Ordering::Acquire) == HALF_OPEN {
            self.half_open_probes.store(0, Ordering::Release);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Allowed { probe: bool },
    Rejected { retry_after_ms: Option<u64> },
}

/// Per-provider circuit breaker registry.
///
/// - Closed: failures increment a counter that resets on success
/// - Open after `failure_threshold` consecutive failures; every call fails fast
/// - HalfOpen once the cooldown elapsed; exactly one probe at a time
/// - A successful probe closes, a failed probe reopens and restarts the cooldown
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    cells: DashMap<ProviderIdentity, Arc<BreakerCell>>,
    defaults: CircuitBreakerConfig,
}

/// Admission granted by [`CircuitBreaker::admit`].
///
/// Resolve it with [`succeed`](Self::succeed) or [`fail`](Self::fail).
/// Dropping an unresolved probe permit frees the half-open probe slot without
/// recording an outcome (e.g. the caller cancelled).
#[derive(Debug)]
pub struct BreakerPermit {
    cell: Arc<BreakerCell>,
    probe: bool,
    resolved: bool,
}

impl BreakerPermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn succeed(mut self) -> Option<BreakerTransition> {
        self.resolved = true;
        self.cell.on_success()
    }

    pub fn fail(mut self) -> Option<BreakerTransition> {
        self.resolved = true;
        self.cell.on_failure(monotonic_ms())
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if self.probe && !self.resolved {
            self.cell.release_probe();
        }
    }
}

/// Why [`CircuitBreaker::admit`] refused a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerRejection {
    /// Time until the cooldown ends; `None` while a half-open probe is running.
    pub retry_after_ms: Option<u64>,
    pub transition: Option<BreakerTransition>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose lazily created cells use `defaults` until configured.
    pub fn with_defaults(defaults: CircuitBreakerConfig) -> Self {
        Self {
            cells: DashMap::new(),
            defaults,
        }
    }

    fn cell(&self, identity: &ProviderIdentity) -> Arc<BreakerCell> {
        if let Some(cell) = self.cells.get(identity) {
            return Arc::clone(cell.value());
        }
        Arc::clone(
            self.cells
                .entry(identity.clone())
                .or_insert_with(|| Arc::new(BreakerCell::new(&self.defaults)))
                .value(),
        )
    }

    /// Set threshold and cooldown for one provider. Takes effect on the next
    /// admission; the current state is kept.
    pub fn configure(&self, identity: &ProviderIdentity, cfg: &CircuitBreakerConfig) {
        self.cell(identity).apply(cfg);
    }

    /// Whether a call to `identity` may proceed. In HalfOpen a `true` answer
    /// takes the single probe slot; the caller must report the outcome.
    pub fn allow(&self, identity: &ProviderIdentity) -> bool {
        matches!(
            self.cell(identity).decide(monotonic_ms()).0,
            Decision::Allowed { .. }
        )
    }

    pub fn record_success(&self, identity: &ProviderIdentity) -> Option<BreakerTransition> {
        self.cell(identity).on_success()
    }

    pub fn record_failure(&self, identity: &ProviderIdentity) -> Option<BreakerTransition> {
        self.cell(identity).on_failure(monotonic_ms())
    }

    /// Admission as a permit that carries its probe slot.
    pub fn admit(
        &self,
        identity: &ProviderIdentity,
        cfg: &CircuitBreakerConfig,
    ) -> Result<(BreakerPermit, Option<BreakerTransition>), BreakerRejection> {
        let cell = self.cell(identity);
        cell.apply(cfg);
        match cell.decide(monotonic_ms()) {
            (Decision::Allowed { probe }, transition) => Ok((
                BreakerPermit {
                    cell,
                    probe,
                    resolved: false,
                },
                transition,
            )),
            (Decision::Rejected { retry_after_ms }, transition) => Err(BreakerRejection {
                retry_after_ms,
                transition,
            }),
        }
    }

    pub fn state(&self, identity: &ProviderIdentity) -> BreakerState {
        self.cells
            .get(identity)
            .map(|c| c.state())
            .unwrap_or(BreakerState::Closed)
    }

    pub fn snapshot(&self, identity: &ProviderIdentity) -> BreakerSnapshot {
        let now = monotonic_ms();
        match self.cells.get(identity) {
            Some(cell) => {
                let state = cell.state();
                BreakerSnapshot {
                    identity: identity.clone(),
                    state,
                    failure_threshold: cell.failure_threshold.load(Ordering::Acquire),
                    cooldown_ms: cell.cooldown_ms.load(Ordering::Acquire),
                    consecutive_failures: cell.consecutive_failures.load(Ordering::Acquire),
                    open_remaining_ms: (state == BreakerState::Open)
                        .then(|| cell.open_remaining_ms(now)),
                    half_open_probe_in_flight: state == BreakerState::HalfOpen
                        && cell.half_open_probes.load(Ordering::Acquire) > 0,
                }
            }
            None => BreakerSnapshot {
                identity: identity.clone(),
                state: BreakerState::Closed,
                failure_threshold: self.defaults.failure_threshold,
                cooldown_ms: self.defaults.cooldown.as_millis() as u64,
                consecutive_failures: 0,
                open_remaining_ms: None,
                half_open_probe_in_flight: false,
            },
        }
    }

    /// Drop healthy cells unused for `ttl`. Cells with any failure history
    /// are kept so eviction never resets protection. Returns how many went.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let now = monotonic_ms();
        let ttl_ms = ttl.as_millis() as u64;
        let before = self.cells.len();
        self.cells.retain(|_, cell| {
            let idle = now.saturating_sub(cell.last_used_ms.load(Ordering::Acquire)) >= ttl_ms;
            let healthy = cell.state() == BreakerState::Closed
                && cell.consecutive_failures.load(Ordering::Acquire) == 0;
            !(idle && healthy)
        });
        before.saturating_sub(self.cells.len())
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
