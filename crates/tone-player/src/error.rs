//! Typed errors surfaced by encode sessions.

use thiserror::Error;

/// Errors returned by [`crate::session::EncodeSession`] and format negotiation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Device native sample format has no codec mapping.
    #[error("unsupported device sample format: {format}")]
    UnsupportedFormat {
        /// Debug label of the rejected format.
        format: String,
    },
    /// Device reported a sample rate the codec cannot use.
    #[error("invalid device sample rate: {rate_hz} Hz")]
    InvalidSampleRate { rate_hz: u32 },
    /// A cycle is already encoding/playing on this session.
    #[error("encode session already active")]
    SessionAlreadyActive,
    /// Device reported a fault while playing.
    #[error("output device fault: {0}")]
    DeviceFault(String),
    /// Cycle was cancelled before it produced a result.
    #[error("cycle cancelled")]
    Cancelled,
    /// Codec failed to encode the input.
    #[error("codec error: {0}")]
    Codec(String),
    /// Device could not be opened, initialized or started.
    #[error("output device error: {0}")]
    Device(String),
    /// Control loop is gone (session dropped or thread exited).
    #[error("encode session closed")]
    SessionClosed,
}

impl SessionError {
    /// Wrap an `anyhow` chain from the device collaborator.
    pub(crate) fn device(err: anyhow::Error) -> Self {
        SessionError::Device(format!("{err:#}"))
    }

    /// Wrap an `anyhow` chain from the codec collaborator.
    pub(crate) fn codec(err: anyhow::Error) -> Self {
        SessionError::Codec(format!("{err:#}"))
    }
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;
