//! Protocol tunables.

/// Interval between connectivity rounds.
pub const DEFAULT_LIVENESS_INTERVAL_MS: u64 = 10_000;

/// Peers silent for longer than this are evicted from the routing table.
pub const DEFAULT_STALE_AFTER_MS: u64 = 30_000;

/// Per-target delay between the lookups issued after bootstrap verification.
pub const DEFAULT_BOOTSTRAP_STAGGER_MS: u64 = 4;

/// Per-target delay between lookups issued after announce, leave and refinement.
pub const DEFAULT_QUERY_STAGGER_MS: u64 = 10;

/// Steps a single lookup walk may take before it stops following suggestions.
pub const DEFAULT_LOOKUP_BUDGET: u8 = 16;

/// Unanswered lookup candidates are forgotten after this long.
pub const DEFAULT_CANDIDATE_TTL_MS: u64 = 60_000;

#[derive(Debug, Clone)]
pub struct OverlayConfig {
    pub liveness_interval_ms: u64,
    pub stale_after_ms: u64,
    pub chat_capacity: usize,
    pub bootstrap_stagger_ms: u64,
    pub query_stagger_ms: u64,
    pub lookup_budget: u8,
    pub candidate_ttl_ms: u64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            liveness_interval_ms: DEFAULT_LIVENESS_INTERVAL_MS,
            stale_after_ms: DEFAULT_STALE_AFTER_MS,
            chat_capacity: crate::chat::DEFAULT_CHAT_CAPACITY,
            bootstrap_stagger_ms: DEFAULT_BOOTSTRAP_STAGGER_MS,
            query_stagger_ms: DEFAULT_QUERY_STAGGER_MS,
            lookup_budget: DEFAULT_LOOKUP_BUDGET,
            candidate_ttl_ms: DEFAULT_CANDIDATE_TTL_MS,
        }
    }
}
