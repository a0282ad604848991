//! Error taxonomy shared across the broker.
//!
//! Nothing above the sandbox adapter boundary should ever see an
//! adapter-specific error type; everything gets folded into [`BrokerError`]
//! before it reaches a connection.

use std::fmt;

/// A broker-level error, already classified into the wire taxonomy.
#[derive(Debug, Clone)]
pub enum BrokerError {
    /// Container runtime unreachable or not responding.
    SandboxUnavailable,
    /// Adapter lacks permission to talk to the runtime.
    SandboxPermission,
    /// Requested language image does not exist.
    ImageMissing,
    /// A `start` was rejected because the connection is in backoff.
    RateLimited { retry_after_secs: u64 },
    /// Referenced session id is unknown to this connection/registry.
    SessionNotFound,
    /// Session exists but is no longer accepting writes.
    SessionClosed,
    /// Malformed or oversized client input.
    InvalidInput(&'static str),
    /// Per-connection or global session cap reached.
    LimitExceeded,
    /// Outbound queue could not keep up with sandbox output.
    OutboundBackpressure,
    /// Sandbox I/O stream failed after the session was established; carries
    /// the formatted message text directly since the wire message pins an
    /// exact shape ("Terminal stream error: ...") rather than a fixed string.
    StreamError(String),
    /// Anything else — logged with context, never detailed to the client.
    Internal,
}

impl BrokerError {
    /// The normative wire code from the event protocol's error taxonomy.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::SandboxUnavailable => "DOCKER_UNAVAILABLE",
            Self::SandboxPermission => "EPERM",
            Self::ImageMissing => "DOCKER_IMAGE_MISSING",
            Self::RateLimited { .. } => "DOCKER_RATE_LIMITED",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionClosed => "SESSION_CLOSED",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::LimitExceeded => "LIMIT_EXCEEDED",
            Self::OutboundBackpressure => "OUTBOUND_BACKPRESSURE",
            Self::StreamError(_) => "INTERNAL",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether a client may reasonably retry the operation that produced this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SandboxUnavailable | Self::SandboxPermission | Self::ImageMissing
        )
    }

    /// True for the sandbox-unavailable family that feeds the health gate (§4.6).
    #[must_use]
    pub fn is_sandbox_failure(&self) -> bool {
        matches!(
            self,
            Self::SandboxUnavailable | Self::SandboxPermission | Self::ImageMissing
        )
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SandboxUnavailable => write!(f, "sandbox runtime unavailable"),
            Self::SandboxPermission => write!(f, "sandbox adapter lacks permission"),
            Self::ImageMissing => write!(f, "requested language image is missing"),
            Self::RateLimited { retry_after_secs } => {
                write!(f, "rate limited, retry after {retry_after_secs}s")
            }
            Self::SessionNotFound => write!(f, "session not found"),
            Self::SessionClosed => write!(f, "session closed"),
            Self::InvalidInput(reason) => write!(f, "invalid input: {reason}"),
            Self::LimitExceeded => write!(f, "session limit exceeded"),
            Self::OutboundBackpressure => write!(f, "outbound queue overflow"),
            Self::StreamError(msg) => write!(f, "{msg}"),
            Self::Internal => write!(f, "internal error"),
        }
    }
}

impl std::error::Error for BrokerError {}
