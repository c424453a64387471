//! Core type definitions for Coldstream
//!
//! This module defines the fundamental types used throughout the system:
//! partition identity, the offset domain, leadership terms and the
//! result enums reported by remote-store operations.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one replicated log: namespace, topic and partition index.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ntp {
    pub namespace: String,
    pub topic: String,
    pub partition: u32,
}

impl Ntp {
    /// Create a new NTP tuple
    pub fn new(
        namespace: impl Into<String>,
        topic: impl Into<String>,
        partition: u32,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for Ntp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.topic, self.partition)
    }
}

impl fmt::Debug for Ntp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ntp({self})")
    }
}

/// Revision assigned to a topic at creation time.
///
/// Frozen for the topic's lifetime and used in every remote object key so
/// that partition movement between nodes does not change object names.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
    From, Into,
)]
#[serde(transparent)]
pub struct InitialRevision(u64);

impl InitialRevision {
    #[must_use]
    pub const fn new(rev: u64) -> Self {
        Self(rev)
    }

    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }
}

/// Leadership epoch of the replication group. Monotonically increasing.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
    From, Into, Default,
)]
#[serde(transparent)]
pub struct Term(u64);

impl Term {
    #[must_use]
    pub const fn new(term: u64) -> Self {
        Self(term)
    }

    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }
}

/// Position in the log. Monotonic 64-bit integer.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From,
    Into, Default,
)]
#[serde(transparent)]
pub struct Offset(u64);

impl Offset {
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// The offset immediately after this one.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// The offset immediately before this one, saturating at zero.
    #[must_use]
    pub const fn prev(&self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    #[must_use]
    pub const fn saturating_sub(&self, rhs: u64) -> Self {
        Self(self.0.saturating_sub(rhs))
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Offset({})", self.0)
    }
}

/// Identifier of a node in the replication group.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
    From, Into,
)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }
}

/// Key of an object in the remote store.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct RemoteKey(String);

impl RemoteKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for RemoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteKey({:?})", self.0)
    }
}

impl From<String> for RemoteKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Outcome of an upload (or delete) against the remote store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadResult {
    Success,
    Timeout,
    Failed,
    Cancelled,
}

impl fmt::Display for UploadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Timeout => write!(f, "timeout"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of a download from the remote store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadResult {
    Success,
    NotFound,
    Failed,
    Cancelled,
}

impl fmt::Display for DownloadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::NotFound => write!(f, "notfound"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Kind of segment upload scheduled by the archiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UploadKind {
    NonCompacted,
    Compacted,
}

impl fmt::Display for UploadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonCompacted => write!(f, "non-compacted"),
            Self::Compacted => write!(f, "compacted"),
        }
    }
}
