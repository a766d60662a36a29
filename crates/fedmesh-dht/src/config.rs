//! Tunable parameters for discovery and federation

use std::time::Duration;

use crate::{ALPHA, K};

/// Configuration for the routing table, lookup engine and secure channel
///
/// Defaults match the production deployment; tests shrink the intervals.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Maximum nodes stored per k-bucket
    pub k: usize,

    /// Parallel queries per lookup round
    pub alpha: usize,

    /// Upper bound on lookup rounds before returning the best result so far
    pub max_lookup_rounds: usize,

    /// Per-query deadline for lookup RPCs (ping, find-node, announce)
    pub lookup_timeout: Duration,

    /// Deadline for secure message delivery
    pub message_timeout: Duration,

    /// Acceptance window for the timestamp inside a secure message;
    /// older messages are dropped as replays
    pub message_max_age_secs: u64,

    /// A node unheard from for this long counts as stale
    pub node_staleness_secs: u64,

    /// A bucket untouched for this long is due for a refresh lookup
    pub bucket_refresh_secs: u64,

    /// Pause between health-check sweeps
    pub health_check_interval: Duration,

    /// Failed pings before a node is pruned from the routing table
    pub prune_failure_threshold: u32,

    /// Acceptance window for challenge responses
    pub challenge_max_age_ms: u64,

    /// Health score added on a successful interaction
    pub health_success_gain: f64,

    /// Health score removed on a failed interaction
    pub health_failure_penalty: f64,

    /// Capabilities advertised in our announce manifest
    pub capabilities: Vec<String>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        DhtConfig {
            k: K,
            alpha: ALPHA,
            max_lookup_rounds: 10,
            lookup_timeout: Duration::from_secs(10),
            message_timeout: Duration::from_secs(30),
            message_max_age_secs: 5 * 60,
            node_staleness_secs: 15 * 60,
            bucket_refresh_secs: 60 * 60,
            health_check_interval: Duration::from_secs(5 * 60),
            prune_failure_threshold: 3,
            challenge_max_age_ms: 30_000,
            health_success_gain: 0.1,
            health_failure_penalty: 0.2,
            capabilities: Vec::new(),
        }
    }
}
