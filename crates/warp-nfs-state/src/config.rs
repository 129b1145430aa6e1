//! State-engine configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the state engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Lease duration handed to clients
    pub lease_time: Duration,

    /// Slack added to lease-derived deadlines (grace end, delegation
    /// retention) to absorb clock and network skew
    pub lease_delta: Duration,

    /// How many times a recall callback is reissued on stale-state or
    /// stale-handle transport errors before giving up
    pub recall_retries: u32,

    /// Bound on revoke-and-retry loops inside a single operation
    pub conflict_retries: u32,

    /// Client count above which clients with stale leases and no state are
    /// swept aggressively
    pub client_highwater: usize,

    /// Global cap on clients + owners + opens + locks + delegations;
    /// operations that would create state fail with `Resource` beyond it
    pub state_limit: u64,

    /// Sweep ticks an unconfirmed open-owner may sit idle with no opens
    /// before being discarded
    pub owner_idle_ticks: u32,

    /// Leases older than this are reaped regardless of held state
    pub mouldy_lease: Duration,

    /// Multiple of the lease after which an expired client is considered
    /// stale enough for the sweep to reap when over the high-water mark
    pub stale_lease_factor: u32,

    /// Grant write delegations (read delegations are controlled by the
    /// callback path being up)
    pub write_delegations: bool,

    /// Master switch for delegation grants
    pub delegations: bool,

    /// Stable-storage log path; `None` disables restart recovery and the
    /// grace period with it
    pub stable_path: Option<PathBuf>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            lease_time: Duration::from_secs(90),
            lease_delta: Duration::from_secs(15),
            recall_retries: 4,
            conflict_retries: 10,
            client_highwater: 1000,
            state_limit: 500_000,
            owner_idle_ticks: 4,
            mouldy_lease: Duration::from_secs(86_400),
            stale_lease_factor: 5,
            write_delegations: true,
            delegations: true,
            stable_path: None,
        }
    }
}

impl StateConfig {
    /// Create a config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lease duration
    pub fn with_lease_time(mut self, lease: Duration) -> Self {
        self.lease_time = lease;
        self
    }

    /// Set the lease slack delta
    pub fn with_lease_delta(mut self, delta: Duration) -> Self {
        self.lease_delta = delta;
        self
    }

    /// Set the stable-storage log path
    pub fn with_stable_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.stable_path = Some(path.into());
        self
    }

    /// Set the global state cap
    pub fn with_state_limit(mut self, limit: u64) -> Self {
        self.state_limit = limit;
        self
    }

    /// Disable delegation grants entirely
    pub fn without_delegations(mut self) -> Self {
        self.delegations = false;
        self
    }

    /// Disable write delegations while keeping read delegations
    pub fn without_write_delegations(mut self) -> Self {
        self.write_delegations = false;
        self
    }

    /// Lease plus slack: the lifetime stamped on a renewed lease
    pub fn lease_with_delta(&self) -> Duration {
        self.lease_time + self.lease_delta
    }
}
