//! Replicated-log seam
//!
//! The archiver holds a non-owning handle to its partition's replicated
//! log. The trait exposes exactly what archival needs: the committed
//! offset range, the leadership view, segment enumeration with per-batch
//! boundaries, per-segment read locks, payload access and command
//! replication. The handle must outlive the worker.

use crate::command::ArchivalCommand;
use async_trait::async_trait;
use bytes::Bytes;
use coldstream_common::{NodeId, Ntp, Offset, Result, Term};
use std::ops::Range;
use tokio::sync::OwnedRwLockReadGuard;

/// Boundaries of one record batch within a local segment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchMeta {
    /// First offset of the batch, inclusive
    pub base_offset: Offset,
    /// Last offset of the batch, inclusive
    pub last_offset: Offset,
    /// Start of the batch within the segment payload
    pub byte_offset: u64,
    /// Encoded batch length
    pub size_bytes: u64,
    /// Max wall-clock timestamp in the batch (ms since epoch)
    pub max_timestamp: u64,
    /// False for configuration/control batches
    pub is_data: bool,
    /// True when the batch belongs to an open or committed transaction
    pub is_transactional: bool,
}

impl BatchMeta {
    /// Number of records (offsets) covered by the batch.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.last_offset.get() - self.base_offset.get() + 1
    }
}

/// Descriptor of one closed local segment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalSegment {
    /// Stable name within the local log, e.g. `1000-2.log`
    pub name: String,
    pub base_offset: Offset,
    pub committed_offset: Offset,
    /// Term in which the segment's batches were written
    pub segment_term: Term,
    pub size_bytes: u64,
    /// Non-data record count preceding `base_offset`
    pub delta_offset: u64,
    /// Whether local compaction has rewritten this segment
    pub is_compacted: bool,
    /// Batch boundaries, ordered by base offset
    pub batches: Vec<BatchMeta>,
}

/// Guard preventing a segment from being deleted or truncated while an
/// upload reads its bytes
pub struct SegmentReadLock {
    _guard: OwnedRwLockReadGuard<()>,
}

impl SegmentReadLock {
    #[must_use]
    pub fn new(guard: OwnedRwLockReadGuard<()>) -> Self {
        Self { _guard: guard }
    }
}

/// The partition's replicated log, as seen by its archiver
#[async_trait]
pub trait ReplicatedLog: Send + Sync {
    fn ntp(&self) -> &Ntp;

    /// This node's identity in the replication group.
    fn node_id(&self) -> NodeId;

    /// Current leadership term.
    fn term(&self) -> Term;

    /// Current leader, if any.
    fn leader_id(&self) -> Option<NodeId>;

    fn is_leader(&self) -> bool {
        self.leader_id() == Some(self.node_id())
    }

    /// Highest offset replicated by a quorum.
    fn committed_offset(&self) -> Offset;

    /// Highest offset safe to expose (no open transactions below it).
    fn last_stable_offset(&self) -> Offset;

    /// First offset still present in local storage.
    fn local_start_offset(&self) -> Offset;

    /// Closed segments, ordered by base offset.
    fn segments(&self) -> Vec<LocalSegment>;

    /// Acquire a read lock on a segment, keeping its bytes alive.
    async fn read_lock(&self, segment: &str) -> Result<SegmentReadLock>;

    /// Stream a byte range of a segment's payload.
    async fn read(&self, segment: &str, byte_range: Range<u64>) -> Result<Bytes>;

    /// The segment's transaction metadata blob, if it has one.
    async fn tx_metadata(&self, segment: &str) -> Result<Option<Bytes>>;

    /// Append archival metadata commands through consensus.
    ///
    /// Succeeds only while this node is leader in `term`; returns the
    /// state-machine offset assigned to the last command.
    async fn replicate(&self, term: Term, commands: Vec<ArchivalCommand>) -> Result<u64>;
}
