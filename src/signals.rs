use serde::Serialize;

use crate::resilience::{BreakerSnapshot, RateLimitSnapshot};

/// A lightweight snapshot of runtime "signals" for one provider and caller.
///
/// This is intentionally *facts only* (no policy). Operators and routing
/// layers can build their own decisions on top.
#[derive(Debug, Clone, Serialize)]
pub struct SignalsSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaker: Option<BreakerSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSnapshot>,
    pub sessions: SessionSignals,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionSignals {
    /// Conversations with a record (locked or carrying a provider session).
    pub tracked: usize,
    /// Conversations with a turn in flight.
    pub active_leases: usize,
}

/// What one maintenance pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub breakers: usize,
    pub buckets: usize,
    pub sessions: usize,
}

impl EvictionReport {
    pub fn total(&self) -> usize {
        self.breakers + self.buckets + self.sessions
    }
}
