//! Error types for Coldstream
//!
//! This module defines the common error type used throughout the system.

use crate::types::Term;
use thiserror::Error;

/// Common result type for Coldstream operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Coldstream
#[derive(Debug, Error)]
pub enum Error {
    // Remote store errors
    #[error("remote I/O error: {0}")]
    RemoteIo(String),

    #[error("remote object not found: {0}")]
    RemoteNotFound(String),

    #[error("remote operation timed out: {0}")]
    RemoteTimeout(String),

    // Leadership errors
    #[error("leadership lost")]
    LeadershipLost,

    #[error("term changed: started in {started}, now {current}")]
    TermChanged { started: Term, current: Term },

    // Local log errors
    #[error("local segment not found: {0}")]
    SegmentNotFound(String),

    #[error("local read error: {0}")]
    LocalRead(String),

    // Manifest errors
    #[error("manifest codec error: {0}")]
    ManifestCodec(String),

    #[error("manifest entry conflict at base offset {base_offset}")]
    ManifestConflict { base_offset: u64 },

    // State machine errors
    #[error("state machine command conflict: {0}")]
    CommandConflict(String),

    #[error("command codec error: {0}")]
    CommandCodec(String),

    // Lifecycle errors
    #[error("shutdown requested")]
    ShutdownRequested,

    #[error("operation cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// True for errors the remote client may retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RemoteIo(_) | Self::RemoteTimeout(_))
    }

    /// True when the error means the worker should stop its current term.
    #[must_use]
    pub fn is_leadership(&self) -> bool {
        matches!(self, Self::LeadershipLost | Self::TermChanged { .. })
    }
}
