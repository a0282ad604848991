//! Session (C4): owns one PTY-attached container for the life of a
//! `terminal:start` .. `terminal:stop`/exit cycle.
//!
//! State machine (monotonic, never backwards):
//! `Creating -> Ready -> Running -> Stopping -> Terminated`, with shortcuts
//! `Creating -> Terminated` (create failed) and `Ready -> Terminated`.

use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::BrokerError;
use crate::registry::SessionRegistry;
use crate::sandbox::{Handle as SandboxHandle, SandboxAdapter, SandboxIo, SizeHint};
use crate::stream::{StreamPolicy, StreamProcessor};

/// Outbound frame a session hands to its owning connection. The connection
/// handler is responsible for JSON-encoding these as `terminal:*` events.
#[derive(Debug, Clone)]
pub enum OutboundEvent {
    Ready {
        session_id: String,
    },
    Data {
        session_id: String,
        chunk: String,
    },
    Exit {
        session_id: String,
        reason: String,
        code: Option<i32>,
    },
    Error {
        session_id: Option<String>,
        error: BrokerError,
        failure_count: Option<u32>,
        backoff_seconds: Option<u64>,
    },
}

/// Only `Data` chunks count against a connection's `maxOutboundQueueBytes` —
/// control events (ready/exit/error) are small and must always get through
/// so a client can still learn why its session ended.
#[must_use]
pub fn outbound_event_bytes(event: &OutboundEvent) -> usize {
    match event {
        OutboundEvent::Data { chunk, .. } => chunk.len(),
        _ => 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Closed,
    OverCapacity,
}

/// Per-connection outbound sender with byte-size accounting, so sandbox
/// output can't grow the queue without bound while a client is slow to
/// drain it (§5 `MaxOutboundQueueBytes`).
#[derive(Clone)]
pub struct OutboundQueue {
    tx: mpsc::Sender<OutboundEvent>,
    queued_bytes: Arc<AtomicUsize>,
    max_bytes: usize,
}

impl OutboundQueue {
    #[must_use]
    pub fn new(tx: mpsc::Sender<OutboundEvent>, max_bytes: usize) -> Self {
        Self {
            tx,
            queued_bytes: Arc::new(AtomicUsize::new(0)),
            max_bytes,
        }
    }

    /// Enqueue `event`, rejecting `Data` chunks that would push the queue
    /// past `max_bytes` instead of blocking. Callers should terminate the
    /// session on `OverCapacity` rather than retry.
    pub async fn send(&self, event: OutboundEvent) -> SendOutcome {
        let size = outbound_event_bytes(&event);
        if size > 0 {
            let reserved = self.queued_bytes.fetch_add(size, Ordering::Relaxed) + size;
            if reserved > self.max_bytes {
                self.queued_bytes.fetch_sub(size, Ordering::Relaxed);
                return SendOutcome::OverCapacity;
            }
        }
        if self.tx.send(event).await.is_err() {
            if size > 0 {
                self.queued_bytes.fetch_sub(size, Ordering::Relaxed);
            }
            return SendOutcome::Closed;
        }
        SendOutcome::Sent
    }

    /// Handle to the live byte counter, given to the connection's send task
    /// so it can release bytes as events are drained onto the socket.
    #[must_use]
    pub fn queued_bytes_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.queued_bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Creating,
    Ready,
    Running,
    Stopping,
    Terminated,
}

/// Timeouts that drive a session's involuntary `Stop` path.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    pub idle: Duration,
    pub max_lifetime: Duration,
    pub adapter_create: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(1800),
            max_lifetime: Duration::from_secs(3600),
            adapter_create: Duration::from_secs(10),
        }
    }
}

pub struct Session {
    pub id: String,
    pub connection_id: String,
    state: Mutex<SessionState>,
    stdin: Mutex<Option<WriteHalf<Box<dyn SandboxIo>>>>,
    sandbox_handle: Mutex<Option<SandboxHandle>>,
    adapter: Arc<dyn SandboxAdapter>,
    cols: AtomicU16,
    rows: AtomicU16,
    created_at: Instant,
    last_activity_secs: AtomicU64,
    cancel: CancellationToken,
    timeouts: SessionTimeouts,
    outbound: OutboundQueue,
    /// Back-pointer so every termination path (reader EOF, stream error,
    /// idle/lifetime timeout, explicit stop) prunes itself from the
    /// registry, not just the ones a connection handler happens to drive.
    registry: Weak<SessionRegistry>,
}

impl Session {
    /// Create and attach a sandbox container, then spawn the reader task and
    /// timeout watchdog. On adapter failure the session never reaches
    /// `Ready` and no background tasks are spawned.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        id: String,
        connection_id: String,
        language: &str,
        size: SizeHint,
        adapter: Arc<dyn SandboxAdapter>,
        stream_policy: StreamPolicy,
        timeouts: SessionTimeouts,
        outbound: OutboundQueue,
        registry: Weak<SessionRegistry>,
    ) -> Result<Arc<Session>, BrokerError> {
        let create_result = tokio::time::timeout(
            timeouts.adapter_create,
            adapter.create_interactive(language, size),
        )
        .await;

        let (handle, io) = match create_result {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(classify_sandbox_error(e)),
            Err(_timeout) => return Err(BrokerError::SandboxUnavailable),
        };

        let (reader, writer) = split(io);
        let now = Instant::now();

        let session = Arc::new(Session {
            id: id.clone(),
            connection_id,
            state: Mutex::new(SessionState::Ready),
            stdin: Mutex::new(Some(writer)),
            sandbox_handle: Mutex::new(Some(handle)),
            adapter,
            cols: AtomicU16::new(size.cols),
            rows: AtomicU16::new(size.rows),
            created_at: now,
            last_activity_secs: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            timeouts,
            outbound,
            registry,
        });

        let _ = session
            .outbound
            .send(OutboundEvent::Ready { session_id: id })
            .await;

        tokio::spawn(reader_task(Arc::clone(&session), reader, stream_policy));
        tokio::spawn(timeout_watchdog(Arc::clone(&session)));

        Ok(session)
    }

    #[must_use]
    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    fn touch_activity(&self) {
        #[allow(clippy::cast_possible_truncation)]
        let secs = self.created_at.elapsed().as_secs();
        self.last_activity_secs.store(secs, Ordering::Relaxed);
    }

    /// Write validated input bytes to the sandbox's stdin. Rejects writes
    /// once the session has left `Ready`/`Running`.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), BrokerError> {
        {
            let state = self.state.lock().await;
            if matches!(*state, SessionState::Stopping | SessionState::Terminated) {
                return Err(BrokerError::SessionClosed);
            }
        }
        if bytes.is_empty() {
            // Keepalive no-op: does not reset the idle timer (§8 boundary behavior).
            return Ok(());
        }
        self.touch_activity();
        self.transition_to_running().await;

        let mut guard = self.stdin.lock().await;
        if let Some(writer) = guard.as_mut() {
            writer
                .write_all(bytes)
                .await
                .map_err(|_| BrokerError::SessionClosed)?;
            Ok(())
        } else {
            Err(BrokerError::SessionClosed)
        }
    }

    async fn transition_to_running(&self) {
        let mut state = self.state.lock().await;
        if *state == SessionState::Ready {
            *state = SessionState::Running;
        }
    }

    /// Best-effort PTY resize. Stored size updates even if the adapter call
    /// fails, per L1.
    pub async fn resize(&self, cols: u16, rows: u16) {
        self.cols.store(cols, Ordering::Relaxed);
        self.rows.store(rows, Ordering::Relaxed);
        let handle = self.sandbox_handle.lock().await.clone();
        if let Some(handle) = handle {
            if let Err(e) = self.adapter.resize(&handle, cols, rows).await {
                warn!(session_id = %self.id, "resize failed: {e:?}");
            }
        }
    }

    #[must_use]
    pub fn size(&self) -> (u16, u16) {
        (self.cols.load(Ordering::Relaxed), self.rows.load(Ordering::Relaxed))
    }

    /// Backstop check used by the registry's periodic sweep; the session's
    /// own watchdog normally catches this first.
    #[must_use]
    pub fn expiry_reason(&self) -> Option<&'static str> {
        if self.created_at.elapsed() >= self.timeouts.max_lifetime {
            return Some("lifetime exceeded");
        }
        let idle_secs = self
            .created_at
            .elapsed()
            .as_secs()
            .saturating_sub(self.last_activity_secs.load(Ordering::Relaxed));
        if Duration::from_secs(idle_secs) >= self.timeouts.idle {
            return Some("idle timeout");
        }
        None
    }

    /// Idempotent stop: the first caller drives the transition, adapter
    /// cleanup, and registry pruning; later callers return immediately (P6).
    pub async fn stop(&self, reason: &str) {
        {
            let mut state = self.state.lock().await;
            if matches!(*state, SessionState::Stopping | SessionState::Terminated) {
                return;
            }
            *state = SessionState::Stopping;
        }

        self.cancel.cancel();

        // Close stdin first so the child sees EOF promptly.
        if let Some(mut writer) = self.stdin.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        let handle = self.sandbox_handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = self.adapter.stop(&handle, 3000).await {
                warn!(session_id = %self.id, "adapter stop failed: {e:?}");
            }
            if let Err(e) = self.adapter.remove(&handle).await {
                warn!(session_id = %self.id, "adapter remove failed: {e:?}");
            }
        }

        *self.state.lock().await = SessionState::Terminated;
        info!(session_id = %self.id, reason, "session terminated");

        let _ = self
            .outbound
            .send(OutboundEvent::Exit {
                session_id: self.id.clone(),
                reason: reason.to_string(),
                code: None,
            })
            .await;

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id).await;
        }
    }
}

fn classify_sandbox_error(e: crate::sandbox::SandboxError) -> BrokerError {
    use crate::sandbox::SandboxError;
    match e {
        SandboxError::Unavailable => BrokerError::SandboxUnavailable,
        SandboxError::Permission => BrokerError::SandboxPermission,
        SandboxError::ImageMissing => BrokerError::ImageMissing,
        SandboxError::Internal => BrokerError::Internal,
    }
}

async fn reader_task(
    session: Arc<Session>,
    mut reader: ReadHalf<Box<dyn SandboxIo>>,
    policy: StreamPolicy,
) {
    let mut processor = StreamProcessor::new(policy);
    let mut buf = [0u8; 8192];

    loop {
        tokio::select! {
            () = session.cancel.cancelled() => break,
            result = reader.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        // EOF: clean process exit.
                        let tail = processor.end();
                        for chunk in tail {
                            let _ = session.outbound.send(OutboundEvent::Data {
                                session_id: session.id.clone(),
                                chunk,
                            }).await;
                        }
                        session.stop("Terminal stream closed").await;
                        break;
                    }
                    Ok(n) => {
                        session.touch_activity();
                        let chunks = processor.push(&buf[..n]);
                        for chunk in chunks {
                            match session.outbound.send(OutboundEvent::Data {
                                session_id: session.id.clone(),
                                chunk,
                            }).await {
                                SendOutcome::Sent => {}
                                SendOutcome::Closed => {
                                    session.stop("connection closed").await;
                                    return;
                                }
                                SendOutcome::OverCapacity => {
                                    let _ = session.outbound.send(OutboundEvent::Error {
                                        session_id: Some(session.id.clone()),
                                        error: BrokerError::OutboundBackpressure,
                                        failure_count: None,
                                        backoff_seconds: None,
                                    }).await;
                                    session.stop("outbound backpressure").await;
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        let message = format!("Terminal stream error: {e}");
                        let _ = session.outbound.send(OutboundEvent::Error {
                            session_id: Some(session.id.clone()),
                            error: BrokerError::StreamError(message),
                            failure_count: None,
                            backoff_seconds: None,
                        }).await;
                        warn!(session_id = %session.id, "stream read error: {e}");
                        session.stop("Terminal stream closed").await;
                        break;
                    }
                }
            }
        }
    }
}

async fn timeout_watchdog(session: Arc<Session>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            () = session.cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        if let Some(reason) = session.expiry_reason() {
            session.stop(reason).await;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::fake::{CreateBehavior, FakeAdapter};

    fn test_outbound() -> (OutboundQueue, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (OutboundQueue::new(tx, usize::MAX), rx)
    }

    #[tokio::test]
    async fn start_failure_never_reaches_ready() {
        let adapter = FakeAdapter::new(CreateBehavior::Fail(crate::sandbox::SandboxError::Unavailable));
        let (outbound, _rx) = test_outbound();
        let result = Session::start(
            "s1".into(),
            "c1".into(),
            "python",
            SizeHint::default(),
            adapter,
            StreamPolicy::default(),
            SessionTimeouts::default(),
            outbound,
            Weak::new(),
        )
        .await;
        assert!(matches!(result, Err(BrokerError::SandboxUnavailable)));
    }

    #[tokio::test]
    async fn double_stop_is_idempotent() {
        let adapter = FakeAdapter::new(CreateBehavior::Succeed);
        let (outbound, mut rx) = test_outbound();
        let session = Session::start(
            "s1".into(),
            "c1".into(),
            "python",
            SizeHint::default(),
            adapter,
            StreamPolicy::default(),
            SessionTimeouts::default(),
            outbound,
            Weak::new(),
        )
        .await
        .unwrap();

        assert!(matches!(rx.recv().await, Some(OutboundEvent::Ready { .. })));

        session.stop("user requested").await;
        session.stop("user requested").await;

        let mut exits = 0;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, OutboundEvent::Exit { .. }) {
                exits += 1;
            }
        }
        assert_eq!(exits, 1);
    }

    #[tokio::test]
    async fn resize_persists_even_without_reading_adapter_result() {
        let adapter = FakeAdapter::new(CreateBehavior::Succeed);
        let (outbound, mut rx) = test_outbound();
        let session = Session::start(
            "s1".into(),
            "c1".into(),
            "python",
            SizeHint::default(),
            adapter,
            StreamPolicy::default(),
            SessionTimeouts::default(),
            outbound,
            Weak::new(),
        )
        .await
        .unwrap();
        let _ = rx.recv().await;

        session.resize(120, 40).await;
        assert_eq!(session.size(), (120, 40));
    }
}
