//! Error types for the child-parent IPC transport.

use thiserror::Error;

/// Errors that can occur sending or serving a [`crate::Request`]/[`crate::Reply`].
#[derive(Debug, Error)]
pub enum IpcError {
    /// I/O error communicating over the control socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol deserialization error.
    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// Protocol serialization error.
    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// The peer is on an incompatible protocol version.
    #[error("incompatible protocol version: peer={peer}, ours={ours}")]
    VersionMismatch { peer: u32, ours: u32 },

    /// A `Reply` with an empty tag buffer — a fatal protocol violation
    /// per the action dispatch contract (§4.4): a `DONE` reply must always
    /// carry the tag store, even when unmodified.
    #[error("protocol violation: reply carried no tag buffer")]
    MissingTagBuffer,

    /// A reply whose id did not match any outstanding request.
    #[error("protocol violation: unexpected reply id {0}")]
    UnexpectedReplyId(u32),

    /// Connection closed unexpectedly.
    #[error("connection closed")]
    ConnectionClosed,

    /// Request timed out waiting for a reply.
    #[error("request timed out")]
    Timeout,

    /// Control socket path is invalid or unreachable.
    #[error("invalid socket path: {0}")]
    InvalidSocketPath(String),
}

impl IpcError {
    /// A protocol violation is fatal: the child or parent that observes one
    /// must terminate rather than continue operating on an inconsistent
    /// transport (§7.4).
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MissingTagBuffer | Self::UnexpectedReplyId(_) | Self::VersionMismatch { .. }
        )
    }

    /// Everything else is an ordinary, recoverable error: the caller may
    /// retry, or abandon just the one message/action without tearing down
    /// the process.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !self.is_fatal()
    }
}

/// Result type for IPC operations.
pub type Result<T> = std::result::Result<T, IpcError>;
