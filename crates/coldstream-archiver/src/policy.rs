//! Archival policy
//!
//! Stateless candidate selection. Given the desired offset window and the
//! local log, yields the next upload candidate together with the read
//! locks that keep its bytes alive. Candidates always start and end on
//! batch boundaries; a window that starts mid-segment produces a prefix
//! cut, and a window that ends mid-segment is truncated to the last batch
//! that fits.

use coldstream_common::{Ntp, Offset, Result, Term, UploadKind};
use coldstream_stm::{LocalSegment, ReplicatedLog, SegmentReadLock};
use std::ops::Range;
use tracing::{debug, warn};

/// One source byte range of an upload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentSource {
    /// Name of the local segment
    pub name: String,
    /// Byte range within the segment payload
    pub byte_range: Range<u64>,
}

/// A segment (or segment prefix) selected for upload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadCandidate {
    /// Local byte ranges to concatenate, ordered
    pub sources: Vec<SegmentSource>,
    pub base_offset: Offset,
    pub committed_offset: Offset,
    pub base_timestamp: u64,
    pub max_timestamp: u64,
    pub size_bytes: u64,
    /// Non-data record count preceding `base_offset`
    pub delta_offset: u64,
    pub segment_term: Term,
    pub is_compacted: bool,
    /// Whether the covered range contains transactional batches
    pub has_tx: bool,
}

/// Candidate plus the read locks that keep its segments alive
pub struct UploadCandidateWithLocks {
    pub candidate: UploadCandidate,
    pub locks: Vec<SegmentReadLock>,
}

/// Stateless upload candidate selector for one partition
pub struct ArchivalPolicy {
    ntp: Ntp,
}

impl ArchivalPolicy {
    #[must_use]
    pub fn new(ntp: Ntp) -> Self {
        Self { ntp }
    }

    /// Select the next candidate within `[start, end)`.
    ///
    /// Returns `None` when no batch in the window is ready, which tells
    /// the scheduler to stop iterating.
    pub async fn find_candidate(
        &self,
        log: &dyn ReplicatedLog,
        start: Offset,
        end_exclusive: Offset,
        kind: UploadKind,
    ) -> Result<Option<UploadCandidateWithLocks>> {
        if start >= end_exclusive {
            return Ok(None);
        }
        let segment = match self.select_segment(log, start, end_exclusive, kind) {
            Some(segment) => segment,
            None => return Ok(None),
        };

        // Lock first so the cut is computed against bytes that cannot be
        // truncated underneath the upload.
        let lock = log.read_lock(&segment.name).await?;

        let included: Vec<_> = segment
            .batches
            .iter()
            .skip_while(|b| b.base_offset < start)
            .take_while(|b| b.last_offset < end_exclusive)
            .collect();
        let (Some(first), Some(last)) = (included.first(), included.last()) else {
            debug!(ntp = %self.ntp, %start, end = %end_exclusive, segment = %segment.name,
                   "no complete batch in window");
            return Ok(None);
        };
        if first.base_offset > start && segment.base_offset < start {
            // The window starts inside a batch; resume at the next batch
            // boundary rather than splitting a batch.
            warn!(ntp = %self.ntp, %start, batch_base = %first.base_offset,
                  "window start is not on a batch boundary");
        }

        let skipped_non_data: u64 = segment
            .batches
            .iter()
            .take_while(|b| b.base_offset < first.base_offset)
            .filter(|b| !b.is_data)
            .map(|b| b.record_count())
            .sum();

        let byte_start = first.byte_offset;
        let byte_end = last.byte_offset + last.size_bytes;
        let candidate = UploadCandidate {
            sources: vec![SegmentSource {
                name: segment.name.clone(),
                byte_range: byte_start..byte_end,
            }],
            base_offset: first.base_offset,
            committed_offset: last.last_offset,
            base_timestamp: first.max_timestamp,
            max_timestamp: included.iter().map(|b| b.max_timestamp).max().unwrap_or(0),
            size_bytes: byte_end - byte_start,
            delta_offset: segment.delta_offset + skipped_non_data,
            segment_term: segment.segment_term,
            is_compacted: kind == UploadKind::Compacted,
            has_tx: included.iter().any(|b| b.is_transactional),
        };
        debug!(ntp = %self.ntp, base = %candidate.base_offset, committed = %candidate.committed_offset,
               size = candidate.size_bytes, %kind, "selected upload candidate");
        Ok(Some(UploadCandidateWithLocks {
            candidate,
            locks: vec![lock],
        }))
    }

    fn select_segment(
        &self,
        log: &dyn ReplicatedLog,
        start: Offset,
        end_exclusive: Offset,
        kind: UploadKind,
    ) -> Option<LocalSegment> {
        log.segments()
            .into_iter()
            .filter(|s| kind == UploadKind::NonCompacted || s.is_compacted)
            .find(|s| s.committed_offset >= start && s.base_offset < end_exclusive)
    }
}
