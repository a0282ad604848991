//! Sandbox Adapter: the abstraction over the container runtime.
//!
//! Everything above this module talks to a `dyn SandboxAdapter`. Concrete
//! adapters translate runtime-specific failures into [`SandboxError`], which
//! [`crate::error::BrokerError`] folds into the wire taxonomy at the call site.

pub mod docker;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Requested initial PTY size for a new container, or the broker defaults.
#[derive(Debug, Clone, Copy)]
pub struct SizeHint {
    pub cols: u16,
    pub rows: u16,
}

impl Default for SizeHint {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Opaque handle to a running sandbox container.
///
/// Adapters attach whatever identifier they need (container id, etc); the
/// broker never inspects this beyond passing it back to the adapter.
#[derive(Debug, Clone)]
pub struct Handle(pub String);

/// Adapter-level failure classification (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxError {
    /// Runtime daemon not reachable.
    Unavailable,
    /// Adapter cannot authenticate/authorize against the runtime.
    Permission,
    /// Requested language image does not exist locally or in the configured registry.
    ImageMissing,
    /// Anything else — daemon returned a 5xx, malformed response, etc.
    Internal,
}

/// A split, full-duplex byte stream attached to a sandbox's PTY.
pub trait SandboxIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SandboxIo for T {}

/// The contract the broker depends on (§4.1). Implementations must be safe to
/// call concurrently from many sessions at once.
#[async_trait]
pub trait SandboxAdapter: Send + Sync {
    /// Create and attach an interactive, PTY-backed container for `language`.
    async fn create_interactive(
        &self,
        language: &str,
        size: SizeHint,
    ) -> Result<(Handle, Box<dyn SandboxIo>), SandboxError>;

    /// Resize the PTY of a running container. Best effort — callers treat
    /// failures as non-fatal to the session.
    async fn resize(&self, handle: &Handle, cols: u16, rows: u16) -> Result<(), SandboxError>;

    /// Stop the container, sending a terminate signal and waiting up to
    /// `grace_ms` before a forced kill.
    async fn stop(&self, handle: &Handle, grace_ms: u64) -> Result<(), SandboxError>;

    /// Reclaim any resources still held for `handle`. Safe to call after
    /// `stop`, and safe to call on a container that auto-removed itself.
    async fn remove(&self, handle: &Handle) -> Result<(), SandboxError>;

    /// Health probe; must not have side effects on running sessions.
    async fn ping(&self) -> Result<(), SandboxError>;
}

#[cfg(test)]
pub mod fake {
    //! An in-memory, scriptable adapter used to exercise everything above the
    //! sandbox boundary without a real container runtime.

    use super::{Handle, SandboxAdapter, SandboxError, SandboxIo, SizeHint};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::io::DuplexStream;
    use tokio::sync::Mutex;

    /// Controls how [`FakeAdapter::create_interactive`] behaves.
    pub enum CreateBehavior {
        Succeed,
        Fail(SandboxError),
    }

    pub struct FakeAdapter {
        pub behavior: Mutex<CreateBehavior>,
        pub created: AtomicU64,
        pub stopped: AtomicU64,
        pub removed: AtomicU64,
        pub healthy: AtomicBool,
        /// The server-side half of the duplex pair handed to the most recent
        /// session, so a test can push bytes as if they came from the sandbox.
        pub last_server_half: Mutex<Option<DuplexStream>>,
    }

    impl FakeAdapter {
        pub fn new(behavior: CreateBehavior) -> Arc<Self> {
            Arc::new(Self {
                behavior: Mutex::new(behavior),
                created: AtomicU64::new(0),
                stopped: AtomicU64::new(0),
                removed: AtomicU64::new(0),
                healthy: AtomicBool::new(true),
                last_server_half: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl SandboxAdapter for FakeAdapter {
        async fn create_interactive(
            &self,
            _language: &str,
            _size: SizeHint,
        ) -> Result<(Handle, Box<dyn SandboxIo>), SandboxError> {
            match &*self.behavior.lock().await {
                CreateBehavior::Fail(e) => Err(*e),
                CreateBehavior::Succeed => {
                    self.created.fetch_add(1, Ordering::SeqCst);
                    let (client, server) = tokio::io::duplex(64 * 1024);
                    *self.last_server_half.lock().await = Some(server);
                    Ok((Handle(format!("fake-{}", self.created.load(Ordering::SeqCst))), Box::new(client)))
                }
            }
        }

        async fn resize(&self, _handle: &Handle, _cols: u16, _rows: u16) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn stop(&self, _handle: &Handle, _grace_ms: u64) -> Result<(), SandboxError> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn remove(&self, _handle: &Handle) -> Result<(), SandboxError> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn ping(&self) -> Result<(), SandboxError> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(SandboxError::Unavailable)
            }
        }
    }
}
