//! Deterministic replay of archival commands
//!
//! The state machine owns the partition manifest. Each applied command
//! advances `insync_offset`; segment metadata displaced by truncation,
//! replacement or compacted adds lands in a bounded deletion queue that
//! garbage collection drains later.

use crate::command::ArchivalCommand;
use coldstream_common::{InitialRevision, Ntp, Offset, Result};
use coldstream_manifest::{AddResult, PartitionManifest, SegmentMeta};
use std::collections::VecDeque;
use tracing::warn;

/// Archival metadata state machine for one partition
pub struct ArchivalStm {
    manifest: PartitionManifest,
    /// insync offset covered by the last uploaded remote manifest
    clean_offset: u64,
    start_kafka_offset: Option<Offset>,
    deletion_queue: VecDeque<SegmentMeta>,
    max_pending_deletion: usize,
}

impl ArchivalStm {
    #[must_use]
    pub fn new(ntp: Ntp, revision: InitialRevision, max_pending_deletion: usize) -> Self {
        Self {
            manifest: PartitionManifest::new(ntp, revision),
            clean_offset: 0,
            start_kafka_offset: None,
            deletion_queue: VecDeque::new(),
            max_pending_deletion,
        }
    }

    #[must_use]
    pub fn manifest(&self) -> &PartitionManifest {
        &self.manifest
    }

    /// insync offset acknowledged by the last remote manifest upload.
    #[must_use]
    pub fn clean_offset(&self) -> u64 {
        self.clean_offset
    }

    /// True when the local view is ahead of the uploaded remote manifest.
    #[must_use]
    pub fn dirty(&self) -> bool {
        self.manifest.insync_offset() > self.clean_offset
    }

    #[must_use]
    pub fn start_kafka_offset(&self) -> Option<Offset> {
        self.start_kafka_offset
    }

    #[must_use]
    pub fn pending_deletions(&self) -> usize {
        self.deletion_queue.len()
    }

    /// Apply one replicated command at the given state-machine offset.
    pub fn apply(&mut self, stm_offset: u64, command: &ArchivalCommand) -> Result<()> {
        match command {
            ArchivalCommand::AddSegment(meta) => {
                if let AddResult::Added { replaced } = self.manifest.add(meta.clone())? {
                    self.queue_deletions(replaced);
                }
            }
            ArchivalCommand::Truncate { new_start_offset } => {
                let dropped = self.manifest.truncate(*new_start_offset);
                self.queue_deletions(dropped);
            }
            ArchivalCommand::MarkClean { insync_offset: _ } => {
                // The clean marker covers everything up to and including
                // the command itself, so a trailing MarkClean never leaves
                // the view dirty.
                self.clean_offset = self.clean_offset.max(stm_offset);
            }
            ArchivalCommand::ReplaceSegments { merged, replaced } => {
                let removed = self.manifest.replace(merged.clone(), replaced)?;
                self.queue_deletions(removed);
            }
            ArchivalCommand::UpdateStartKafkaOffset { offset } => {
                self.start_kafka_offset = Some(self.start_kafka_offset.map_or(*offset, |o| {
                    o.max(*offset)
                }));
            }
        }
        self.manifest.advance_insync(stm_offset);
        Ok(())
    }

    /// Adopt a manifest downloaded from the remote store (mirror mode,
    /// or leader recovery). Rejected when it is older than the local view.
    pub fn reset_from_manifest(&mut self, manifest: PartitionManifest) -> bool {
        if manifest.insync_offset() < self.manifest.insync_offset() {
            return false;
        }
        self.clean_offset = self.clean_offset.max(manifest.insync_offset());
        self.manifest = manifest;
        true
    }

    /// Take up to `limit` queued deletions, oldest first.
    pub fn take_deletions(&mut self, limit: usize) -> Vec<SegmentMeta> {
        let n = limit.min(self.deletion_queue.len());
        self.deletion_queue.drain(..n).collect()
    }

    /// Put back deletions whose blobs could not be removed this tick.
    pub fn requeue_deletions(&mut self, metas: Vec<SegmentMeta>) {
        for meta in metas {
            self.deletion_queue.push_back(meta);
        }
        self.enforce_deletion_bound();
    }

    fn queue_deletions(&mut self, metas: Vec<SegmentMeta>) {
        self.deletion_queue.extend(metas);
        self.enforce_deletion_bound();
    }

    fn enforce_deletion_bound(&mut self) {
        while self.deletion_queue.len() > self.max_pending_deletion {
            let dropped = self.deletion_queue.pop_front();
            if let Some(meta) = dropped {
                warn!(
                    ntp = %self.manifest.ntp(),
                    base_offset = %meta.base_offset,
                    "deletion queue full, dropping oldest entry; blob will be orphaned"
                );
            }
        }
    }
}
