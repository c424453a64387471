//! Common types for Coldstream
//!
//! Shared building blocks used by every Coldstream crate: partition
//! identity, the offset/term domain, the shared error type and the
//! archiver configuration.

pub mod config;
pub mod error;
pub mod types;

pub use config::ArchiverConfig;
pub use error::{Error, Result};
pub use types::{
    DownloadResult, InitialRevision, NodeId, Ntp, Offset, RemoteKey, Term, UploadKind,
    UploadResult,
};
