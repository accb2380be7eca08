//! Domain-specific error types for the winstream pipeline.
//!
//! Fallible operations return `Result<T, StreamError>`.
//! Encoders report failures with [`EncodeError`], which the encode worker
//! logs and hands to the caller without stopping.

use thiserror::Error;

use crate::codec::Encoding;

/// The canonical error type for the winstream pipeline.
#[derive(Debug, Error)]
pub enum StreamError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// A wire frame could not be parsed.
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),

    /// Frame size exceeded the codec limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The peer sent a packet that is not valid in the current phase.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // ── Negotiation Errors ───────────────────────────────────────
    /// The client and the codec registry share no encoding.
    #[error("no common encodings (server: {server}, client: {client})")]
    NoCommonEncodings { server: String, client: String },

    /// No window source exists for this id.
    #[error("unknown window: {0}")]
    UnknownWindow(u32),

    // ── Encoding Errors ──────────────────────────────────────────
    /// An encoder failed to produce a payload.
    #[error("encoding failed: {0}")]
    Encode(#[from] EncodeError),

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding or decoding of a wire packet failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── EncodeError ──────────────────────────────────────────────────

/// Failure result of a single encode attempt.
///
/// None of these are fatal: the window stays usable for the next
/// damage event.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EncodeError {
    /// No encoder is registered for the requested encoding.
    #[error("no encoder found for {0}")]
    NoEncoder(Encoding),

    /// The encoder ran but returned an error.
    #[error("{encoding} encoder failed: {message}")]
    Failed { encoding: Encoding, message: String },

    /// The shared memory area has no room for this frame.
    #[error("mmap area full: need {needed} bytes, {available} available")]
    MmapFull { needed: usize, available: usize },

    /// The pixel buffer does not match its declared geometry.
    #[error("invalid image: {0}")]
    InvalidImage(&'static str),
}

impl EncodeError {
    /// Wrap any displayable codec error.
    pub fn failed(encoding: Encoding, err: impl std::fmt::Display) -> Self {
        EncodeError::Failed {
            encoding,
            message: err.to_string(),
        }
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::Other(s)
    }
}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        StreamError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for StreamError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        StreamError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for StreamError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        StreamError::Serialization(e.to_string())
    }
}
