//! Shared application state passed to every handler via Axum's `State` extractor.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::Config;
use crate::health_gate::HealthGate;
use crate::registry::SessionRegistry;
use crate::sandbox::SandboxAdapter;

/// Cached adapter health, refreshed at most once per `healthCacheSeconds`
/// (§4.8: `/health` must not trigger a sandbox probe on every call).
pub struct HealthCache {
    healthy: AtomicBool,
    last_checked: Mutex<Instant>,
    ttl: Duration,
}

impl HealthCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            healthy: AtomicBool::new(true),
            last_checked: Mutex::new(Instant::now() - ttl),
            ttl,
        }
    }

    /// Returns the cached value, refreshing via `ping()` if the TTL elapsed.
    pub async fn get(&self, adapter: &Arc<dyn SandboxAdapter>) -> bool {
        let mut last = self.last_checked.lock().await;
        if last.elapsed() >= self.ttl {
            let healthy = adapter.ping().await.is_ok();
            self.healthy.store(healthy, Ordering::Relaxed);
            *last = Instant::now();
        }
        self.healthy.load(Ordering::Relaxed)
    }
}

/// Shared application state for the broker.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub start_time: Instant,
    pub adapter: Arc<dyn SandboxAdapter>,
    pub registry: Arc<SessionRegistry>,
    pub health_gate: Arc<HealthGate>,
    pub health_cache: Arc<HealthCache>,
    /// Connection ids currently attached, so the periodic sweep can prune
    /// `health_gate` state for connections that closed without running
    /// their own disconnect cleanup (a backstop for `HealthGate::forget`).
    pub connections: Arc<Mutex<HashSet<String>>>,
}
