//! Session Registry (C5): the single source of truth mapping session ids to
//! sessions and connections to the sessions they own, with per-connection and
//! global caps enforced under one lock to avoid TOCTOU races.
//!
//! Invariant (§3): the registry holds a session iff its state is live
//! (`Creating`..`Stopping`). `Session::stop` upgrades its own back-pointer
//! into this registry and calls [`SessionRegistry::remove`] itself, so every
//! termination path — reader EOF, stream error, idle/lifetime timeout,
//! explicit stop, disconnect, shutdown drain — prunes the registry, not just
//! the ones a connection handler happens to drive.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use rand::RngCore;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::BrokerError;
use crate::sandbox::{SandboxAdapter, SizeHint};
use crate::session::{OutboundQueue, Session, SessionTimeouts};
use crate::stream::StreamPolicy;

#[derive(Debug, Clone, Copy)]
pub struct RegistryLimits {
    pub max_sessions_per_connection: usize,
    pub max_global_sessions: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_sessions_per_connection: 5,
            max_global_sessions: 256,
        }
    }
}

struct Inner {
    sessions: HashMap<String, Arc<Session>>,
    by_connection: HashMap<String, HashSet<String>>,
    /// Reservations for sessions mid-`Creating`, counted against the caps
    /// before the adapter call resolves.
    reserved: HashMap<String, String>,
}

pub struct SessionRegistry {
    inner: RwLock<Inner>,
    limits: RegistryLimits,
    self_weak: Weak<SessionRegistry>,
    lifetime_sessions: AtomicU64,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(limits: RegistryLimits) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            inner: RwLock::new(Inner {
                sessions: HashMap::new(),
                by_connection: HashMap::new(),
                reserved: HashMap::new(),
            }),
            limits,
            self_weak: weak.clone(),
            lifetime_sessions: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn generate_session_id() -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Reserve a slot for a new session, enforcing caps atomically with
    /// respect to every other create/remove. Returns the reserved id.
    async fn reserve(&self, connection_id: &str) -> Result<String, BrokerError> {
        let mut inner = self.inner.write().await;

        let total_live = inner.sessions.len() + inner.reserved.len();
        if total_live >= self.limits.max_global_sessions {
            return Err(BrokerError::LimitExceeded);
        }
        let owned = inner
            .by_connection
            .get(connection_id)
            .map_or(0, HashSet::len)
            + inner
                .reserved
                .values()
                .filter(|c| c.as_str() == connection_id)
                .count();
        if owned >= self.limits.max_sessions_per_connection {
            return Err(BrokerError::LimitExceeded);
        }

        let id = Self::generate_session_id();
        inner.reserved.insert(id.clone(), connection_id.to_string());
        Ok(id)
    }

    async fn commit(&self, id: &str, connection_id: &str, session: Arc<Session>) {
        let mut inner = self.inner.write().await;
        inner.reserved.remove(id);
        inner.sessions.insert(id.to_string(), session);
        inner
            .by_connection
            .entry(connection_id.to_string())
            .or_default()
            .insert(id.to_string());
        drop(inner);
        self.lifetime_sessions.fetch_add(1, Ordering::Relaxed);
    }

    async fn abandon_reservation(&self, id: &str) {
        let mut inner = self.inner.write().await;
        inner.reserved.remove(id);
    }

    /// Create a new session owned by `connection_id`. On adapter failure the
    /// reservation is released and no session is added to the registry.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        connection_id: &str,
        language: &str,
        size: SizeHint,
        adapter: Arc<dyn SandboxAdapter>,
        stream_policy: StreamPolicy,
        timeouts: SessionTimeouts,
        outbound: OutboundQueue,
    ) -> Result<Arc<Session>, BrokerError> {
        let id = self.reserve(connection_id).await?;

        match Session::start(
            id.clone(),
            connection_id.to_string(),
            language,
            size,
            adapter,
            stream_policy,
            timeouts,
            outbound,
            self.self_weak.clone(),
        )
        .await
        {
            Ok(session) => {
                self.commit(&id, connection_id, Arc::clone(&session)).await;
                info!(session_id = %id, connection_id, "session created");
                Ok(session)
            }
            Err(e) => {
                self.abandon_reservation(&id).await;
                Err(e)
            }
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.inner.read().await.sessions.get(session_id).cloned()
    }

    /// Remove `session_id` from all maps. Called by `Session::stop` itself
    /// once a session reaches `Terminated`, so the registry invariant holds
    /// regardless of which path drove the termination.
    pub async fn remove(&self, session_id: &str) {
        let mut inner = self.inner.write().await;
        inner.sessions.remove(session_id);
        inner.by_connection.retain(|_, set| {
            set.remove(session_id);
            !set.is_empty()
        });
    }

    #[must_use]
    pub async fn owned_by(&self, connection_id: &str) -> Vec<Arc<Session>> {
        let inner = self.inner.read().await;
        inner
            .by_connection
            .get(connection_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.sessions.get(id).cloned())
            .collect()
    }

    /// Stop every session owned by a connection (disconnect path). Each
    /// session prunes itself from the registry as it stops.
    pub async fn remove_by_connection(&self, connection_id: &str) {
        let sessions = self.owned_by(connection_id).await;
        for session in sessions {
            session.stop("connection closed").await;
        }
        self.inner.write().await.by_connection.remove(connection_id);
    }

    /// Stop every live session (broker shutdown). Each session prunes
    /// itself from the registry as it stops.
    pub async fn remove_all(&self, reason: &str) {
        let ids: Vec<String> = self.inner.read().await.sessions.keys().cloned().collect();
        for id in ids {
            if let Some(session) = self.get(&id).await {
                session.stop(reason).await;
            }
        }
    }

    /// Stop every session past its idle/lifetime timeout. Each session also
    /// runs its own watchdog; this is a registry-wide backstop pass.
    pub async fn sweep(&self) {
        let sessions: Vec<Arc<Session>> = self.inner.read().await.sessions.values().cloned().collect();
        for session in sessions {
            if let Some(reason) = session.expiry_reason() {
                session.stop(reason).await;
            }
        }
    }

    #[must_use]
    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Total sessions ever created, for `/health` diagnostics (§3 Global
    /// state: "total lifetime sessions").
    #[must_use]
    pub fn lifetime_sessions(&self) -> u64 {
        self.lifetime_sessions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::fake::{CreateBehavior, FakeAdapter};
    use tokio::sync::mpsc;

    fn test_outbound() -> OutboundQueue {
        let (tx, _rx) = mpsc::channel(256);
        OutboundQueue::new(tx, usize::MAX)
    }

    #[tokio::test]
    async fn per_connection_cap_enforced() {
        let registry = SessionRegistry::new(RegistryLimits {
            max_sessions_per_connection: 1,
            max_global_sessions: 256,
        });
        let adapter = FakeAdapter::new(CreateBehavior::Succeed);

        let first = registry
            .create(
                "conn-1",
                "python",
                SizeHint::default(),
                adapter.clone(),
                StreamPolicy::default(),
                SessionTimeouts::default(),
                test_outbound(),
            )
            .await;
        assert!(first.is_ok());

        let second = registry
            .create(
                "conn-1",
                "python",
                SizeHint::default(),
                adapter,
                StreamPolicy::default(),
                SessionTimeouts::default(),
                test_outbound(),
            )
            .await;
        assert!(matches!(second, Err(BrokerError::LimitExceeded)));
    }

    #[tokio::test]
    async fn failed_create_leaves_no_trace_p1() {
        let registry = SessionRegistry::new(RegistryLimits::default());
        let adapter = FakeAdapter::new(CreateBehavior::Fail(crate::sandbox::SandboxError::Unavailable));

        let result = registry
            .create(
                "conn-1",
                "python",
                SizeHint::default(),
                adapter,
                StreamPolicy::default(),
                SessionTimeouts::default(),
                test_outbound(),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn stop_self_prunes_regardless_of_caller() {
        let registry = SessionRegistry::new(RegistryLimits::default());
        let adapter = FakeAdapter::new(CreateBehavior::Succeed);

        let session = registry
            .create(
                "conn-1",
                "python",
                SizeHint::default(),
                adapter,
                StreamPolicy::default(),
                SessionTimeouts::default(),
                test_outbound(),
            )
            .await
            .unwrap();
        assert_eq!(registry.len().await, 1);

        // Simulate a termination path that never calls `registry.remove`
        // directly (e.g. reader-task EOF) — `stop` must prune on its own.
        session.stop("Terminal stream closed").await;
        assert_eq!(registry.len().await, 0);
        assert!(registry.owned_by("conn-1").await.is_empty());
    }
}
