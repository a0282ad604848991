//! Sandbox Health Gate (C6): per-connection exponential backoff after
//! sandbox-unavailable failures, so a dead container runtime doesn't get
//! hammered by retrying clients.
//!
//! `backoffSeconds = min(base * 2^(failureCount-1), max)`. Resets to zero on
//! the next successful start, or when the connection closes.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::BrokerError;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_secs: u64,
    pub max_secs: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_secs: 5,
            max_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ConnectionHealth {
    failure_count: u32,
    backoff_until: Option<Instant>,
    notified_unavailable: bool,
}

/// Tracks sandbox-failure backoff state, keyed by connection id.
pub struct HealthGate {
    policy: BackoffPolicy,
    state: Mutex<HashMap<String, ConnectionHealth>>,
}

impl HealthGate {
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `Err(RateLimited)` without touching the caller's retry path if
    /// `connection_id` is still inside its backoff window.
    pub fn admit_start(&self, connection_id: &str) -> Result<(), BrokerError> {
        let now = Instant::now();
        let guard = self.state.lock().expect("health gate mutex poisoned");
        if let Some(health) = guard.get(connection_id) {
            if let Some(until) = health.backoff_until {
                if now < until {
                    let retry_after_secs = (until - now).as_secs().max(1);
                    return Err(BrokerError::RateLimited { retry_after_secs });
                }
            }
        }
        Ok(())
    }

    /// Record the outcome of a start attempt (after `admit_start` passed).
    /// Returns the failure count and backoff duration when the outcome fed
    /// the backoff sequence, for inclusion in the outbound error frame.
    pub fn on_start_outcome(
        &self,
        connection_id: &str,
        failed: bool,
    ) -> Option<(u32, u64)> {
        let mut guard = self.state.lock().expect("health gate mutex poisoned");
        let health = guard.entry(connection_id.to_string()).or_default();

        if !failed {
            *health = ConnectionHealth::default();
            return None;
        }

        health.failure_count += 1;
        let backoff_secs = Self::backoff_for(self.policy, health.failure_count);
        health.backoff_until = Some(Instant::now() + Duration::from_secs(backoff_secs));
        Some((health.failure_count, backoff_secs))
    }

    /// Whether an advisory "still unavailable" notice has already been sent,
    /// so repeated background probe failures don't spam the client.
    pub fn mark_notified(&self, connection_id: &str) -> bool {
        let mut guard = self.state.lock().expect("health gate mutex poisoned");
        let health = guard.entry(connection_id.to_string()).or_default();
        let already = health.notified_unavailable;
        health.notified_unavailable = true;
        already
    }

    /// Drop all state for a connection that has closed.
    pub fn forget(&self, connection_id: &str) {
        self.state
            .lock()
            .expect("health gate mutex poisoned")
            .remove(connection_id);
    }

    /// Drop state for any connection not present in `active` — a backstop
    /// for `forget`, in case a connection handler task ends without running
    /// its own disconnect cleanup.
    pub fn prune(&self, active: &HashSet<String>) {
        self.state
            .lock()
            .expect("health gate mutex poisoned")
            .retain(|connection_id, _| active.contains(connection_id));
    }

    fn backoff_for(policy: BackoffPolicy, failure_count: u32) -> u64 {
        let exp = failure_count.saturating_sub(1).min(20);
        let scaled = policy.base_secs.saturating_mul(1u64 << exp);
        scaled.min(policy.max_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_matches_p3() {
        let policy = BackoffPolicy::default();
        let expected = [5, 10, 20, 40, 80, 160, 300, 300];
        for (i, exp) in expected.iter().enumerate() {
            let k = (i + 1) as u32;
            assert_eq!(HealthGate::backoff_for(policy, k), *exp);
        }
    }

    #[test]
    fn success_resets_sequence() {
        let gate = HealthGate::new(BackoffPolicy::default());
        gate.on_start_outcome("conn-1", true);
        gate.on_start_outcome("conn-1", true);
        gate.on_start_outcome("conn-1", false);
        let (count, secs) = gate.on_start_outcome("conn-1", true).unwrap();
        assert_eq!(count, 1);
        assert_eq!(secs, 5);
    }

    #[test]
    fn isolated_across_connections_p4() {
        let gate = HealthGate::new(BackoffPolicy::default());
        gate.on_start_outcome("conn-a", true);
        assert!(gate.admit_start("conn-a").is_err());
        assert!(gate.admit_start("conn-b").is_ok());
    }

    #[test]
    fn prune_drops_closed_connections() {
        let gate = HealthGate::new(BackoffPolicy::default());
        gate.on_start_outcome("conn-a", true);
        gate.on_start_outcome("conn-b", true);

        let active: HashSet<String> = ["conn-a".to_string()].into_iter().collect();
        gate.prune(&active);

        // conn-a survives pruning and is still in its backoff window.
        assert!(gate.admit_start("conn-a").is_err());
        // conn-b's state was dropped entirely, so it admits immediately.
        assert!(gate.admit_start("conn-b").is_ok());
    }
}
