//! Housekeeping: retention, garbage collection and adjacent-segment merging
//!
//! Runs on a jittered cadence from the upload loop, serialized with
//! uploads by the per-worker mutex. Retention only advances the start
//! offset; deletion of the blobs below it happens in the garbage
//! collection pass that drains the state machine's deletion queue.

use crate::archiver::NtpArchiver;
use crate::policy::SegmentSource;
use bytes::Bytes;
use coldstream_common::{Offset, RemoteKey, Term, UploadResult};
use coldstream_manifest::{PartitionManifest, SegmentMeta};
use coldstream_remote::paths;
use coldstream_stm::{ArchivalCommand, SegmentReadLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// A run of contiguous manifest entries eligible for merging
#[derive(Clone, Debug)]
pub struct AdjacentSegmentRun {
    pub metas: Vec<SegmentMeta>,
}

impl AdjacentSegmentRun {
    #[must_use]
    pub fn base_offset(&self) -> Offset {
        self.metas[0].base_offset
    }

    #[must_use]
    pub fn committed_offset(&self) -> Offset {
        self.metas[self.metas.len() - 1].committed_offset
    }

    #[must_use]
    pub fn total_size_bytes(&self) -> u64 {
        self.metas.iter().map(|m| m.size_bytes).sum()
    }

    #[must_use]
    pub fn replaced_bases(&self) -> Vec<Offset> {
        self.metas.iter().map(|m| m.base_offset).collect()
    }
}

/// Where the bytes of a reupload come from
pub enum ReuploadSource {
    /// Concatenation of local segment byte ranges, protected by read locks
    Local {
        sources: Vec<SegmentSource>,
        locks: Vec<SegmentReadLock>,
    },
    /// Concatenation of existing remote blobs
    Remote { keys: Vec<RemoteKey> },
}

/// A reupload replacing a run of manifest entries with one merged entry
pub struct ReuploadCandidate {
    pub meta: SegmentMeta,
    pub replaced: Vec<Offset>,
    pub source: ReuploadSource,
}

/// Compute the retention lower bound implied by the configured size and
/// time thresholds. Returns the new start offset only when it advances.
#[must_use]
pub fn compute_retention_start(
    manifest: &PartitionManifest,
    retention_bytes: Option<u64>,
    retention_ms: Option<u64>,
    now_ms: u64,
) -> Option<Offset> {
    if manifest.is_empty() {
        return None;
    }
    let mut new_start = manifest.start_offset();

    if let Some(retention_ms) = retention_ms {
        let cutoff = now_ms.saturating_sub(retention_ms);
        for meta in manifest.iter() {
            if meta.max_timestamp >= cutoff {
                break;
            }
            new_start = new_start.max(meta.committed_offset.next());
        }
    }

    if let Some(retention_bytes) = retention_bytes {
        let mut remaining = manifest.total_size_bytes();
        for meta in manifest.iter() {
            if remaining <= retention_bytes {
                break;
            }
            remaining -= meta.size_bytes;
            new_start = new_start.max(meta.committed_offset.next());
        }
    }

    (new_start > manifest.start_offset()).then_some(new_start)
}

/// Find the first run of at least two contiguous retained entries whose
/// combined size stays under `target_bytes`.
#[must_use]
pub fn find_adjacent_run(
    manifest: &PartitionManifest,
    target_bytes: u64,
) -> Option<AdjacentSegmentRun> {
    let mut run: Vec<SegmentMeta> = Vec::new();
    let mut run_size = 0u64;
    for meta in manifest.iter() {
        let contiguous = run
            .last()
            .is_some_and(|prev| prev.committed_offset.next() == meta.base_offset);
        if contiguous && run_size + meta.size_bytes <= target_bytes {
            run_size += meta.size_bytes;
            run.push(meta.clone());
            continue;
        }
        if run.len() >= 2 {
            return Some(AdjacentSegmentRun { metas: run });
        }
        run_size = meta.size_bytes;
        run = if meta.size_bytes <= target_bytes {
            vec![meta.clone()]
        } else {
            Vec::new()
        };
    }
    (run.len() >= 2).then_some(AdjacentSegmentRun { metas: run })
}

impl NtpArchiver {
    /// Run all housekeeping jobs: retention, garbage collection and, when
    /// enabled, adjacent-segment merging.
    pub async fn housekeeping(&self) {
        let _guard = self.mutex.lock().await;
        let term = self.effective_term();
        if !self.can_update_archival_metadata(term) {
            return;
        }
        debug!(ntp = %self.ntp, "housekeeping");
        self.apply_retention_locked(term).await;
        self.garbage_collect_locked(term).await;
        if self.config.segment_merging_enabled {
            self.merge_adjacent_segments_locked(term).await;
        }
        self.maybe_upload_manifest(term).await;
        self.schedule_next_housekeeping();
    }

    /// Advance the remote start offset per the retention policy. Deletes
    /// no data; the dropped entries are queued for garbage collection.
    pub async fn apply_retention(&self) {
        let _guard = self.mutex.lock().await;
        let term = self.effective_term();
        if self.can_update_archival_metadata(term) {
            self.apply_retention_locked(term).await;
        }
    }

    /// Delete remote blobs that are no longer referenced: the queued
    /// deletions from truncation and replacement, plus orphans left by
    /// interrupted batches of earlier terms.
    pub async fn garbage_collect(&self) {
        let _guard = self.mutex.lock().await;
        let term = self.effective_term();
        if self.can_update_archival_metadata(term) {
            self.garbage_collect_locked(term).await;
        }
    }

    pub(crate) async fn apply_retention_locked(&self, term: Term) {
        if self.config.retention_bytes.is_none() && self.config.retention_ms.is_none() {
            return;
        }
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let new_start = {
            let stm = self.stm.lock();
            compute_retention_start(
                stm.manifest(),
                self.config.retention_bytes,
                self.config.retention_ms,
                now_ms,
            )
        };
        let Some(new_start_offset) = new_start else {
            return;
        };
        info!(ntp = %self.ntp, %new_start_offset, "advancing start offset for retention");
        if let Err(e) = self
            .replicate_and_apply(term, ArchivalCommand::Truncate { new_start_offset })
            .await
        {
            warn!(ntp = %self.ntp, error = %e, "failed to replicate retention truncation");
        }
    }

    pub(crate) async fn garbage_collect_locked(&self, term: Term) {
        let deletions = self
            .stm
            .lock()
            .take_deletions(self.config.max_segments_pending_deletion);
        let chain = self.chain.child();
        let abort = self.lazy_abort(term);

        let mut requeue = Vec::new();
        let mut deletions = deletions.into_iter();
        for meta in deletions.by_ref() {
            if chain.is_cancelled() {
                requeue.push(meta);
                break;
            }
            let path = self.segment_path_for_meta(&meta);
            match self.remote.delete_object(&chain, &abort, &path).await {
                UploadResult::Success => {
                    self.delete_companions(&chain, &abort, &path).await;
                    self.probe.segment_deleted();
                }
                UploadResult::Cancelled => {
                    requeue.push(meta);
                    break;
                }
                result => {
                    // One attempt per tick; the queue retries next time.
                    warn!(ntp = %self.ntp, %path, %result, "failed to delete remote segment");
                    self.probe.gc_failed();
                    requeue.push(meta);
                }
            }
        }
        requeue.extend(deletions);

        self.collect_orphans(&chain, &abort).await;

        let mut stm = self.stm.lock();
        stm.requeue_deletions(requeue);
        self.probe.set_pending_deletions(stm.pending_deletions() as u64);
    }

    async fn delete_companions(
        &self,
        chain: &coldstream_remote::RetryChain,
        abort: &coldstream_remote::LazyAbort,
        segment_path: &RemoteKey,
    ) {
        for companion in [paths::tx_path(segment_path), paths::index_path(segment_path)] {
            let result = self.remote.delete_object(chain, abort, &companion).await;
            if result == UploadResult::Failed || result == UploadResult::Timeout {
                debug!(ntp = %self.ntp, path = %companion, "failed to delete companion object");
            }
        }
    }

    /// Diff the bucket against the manifest: segment blobs of earlier
    /// terms that no manifest entry references were left behind by an
    /// interrupted batch and are deleted here.
    async fn collect_orphans(
        &self,
        chain: &coldstream_remote::RetryChain,
        abort: &coldstream_remote::LazyAbort,
    ) {
        let keys = match self.remote.list_objects(chain, "").await {
            Ok(keys) => keys,
            Err(e) => {
                debug!(ntp = %self.ntp, error = %e, "orphan scan listing failed");
                return;
            }
        };
        let current_term = self.log.term();
        let manifest = self.manifest();
        for key in keys {
            let Some(parsed) = paths::parse_segment_path(&key, &self.ntp, self.revision) else {
                continue;
            };
            // Blobs uploaded in the current term may belong to a batch
            // whose manifest delta has not been replicated yet.
            if parsed.archiver_term >= current_term {
                continue;
            }
            let referenced = manifest
                .get(parsed.base_offset)
                .is_some_and(|m| self.segment_path_for_meta(m) == key);
            if referenced {
                continue;
            }
            info!(ntp = %self.ntp, %key, "deleting orphaned segment blob");
            match self.remote.delete_object(chain, abort, &key).await {
                UploadResult::Success => {
                    self.delete_companions(chain, abort, &key).await;
                    self.probe.segment_deleted();
                }
                UploadResult::Cancelled => return,
                result => {
                    warn!(ntp = %self.ntp, %key, %result, "failed to delete orphaned blob");
                    self.probe.gc_failed();
                }
            }
        }
    }

    pub(crate) async fn merge_adjacent_segments_locked(&self, term: Term) {
        let run = {
            let stm = self.stm.lock();
            find_adjacent_run(stm.manifest(), self.config.segment_merge_target_bytes)
        };
        let Some(run) = run else {
            return;
        };
        let Some(candidate) = self.build_reupload_candidate(term, &run).await else {
            return;
        };
        info!(ntp = %self.ntp, base = %run.base_offset(), committed = %run.committed_offset(),
              segments = run.metas.len(), "merging adjacent small segments");
        if !self.do_reupload(term, candidate, None).await {
            warn!(ntp = %self.ntp, base = %run.base_offset(), "adjacent segment merge failed");
        }
    }

    /// Apply a user-provided scanner to the manifest and build a reupload
    /// candidate for the run it returns. The source is local when the
    /// local log still covers the run exactly, remote otherwise.
    pub async fn find_reupload_candidate<F>(&self, scanner: F) -> Option<ReuploadCandidate>
    where
        F: Fn(Offset, &PartitionManifest) -> Option<AdjacentSegmentRun>,
    {
        let run = {
            let stm = self.stm.lock();
            scanner(self.log.local_start_offset(), stm.manifest())
        }?;
        let term = self.effective_term();
        self.build_reupload_candidate(term, &run).await
    }

    async fn build_reupload_candidate(
        &self,
        term: Term,
        run: &AdjacentSegmentRun,
    ) -> Option<ReuploadCandidate> {
        if run.metas.is_empty() {
            return None;
        }
        let first = &run.metas[0];
        let last = &run.metas[run.metas.len() - 1];
        let meta = SegmentMeta {
            base_offset: first.base_offset,
            committed_offset: last.committed_offset,
            base_timestamp: first.base_timestamp,
            max_timestamp: last.max_timestamp,
            // Corrected to the payload length once the bytes are assembled.
            size_bytes: run.total_size_bytes(),
            delta_offset: first.delta_offset,
            archiver_term: term,
            segment_term: last.segment_term,
            is_compacted: true,
            sname_format: 1,
        };
        let source = match self.build_local_source(&meta).await {
            Some(source) => source,
            None => ReuploadSource::Remote {
                keys: run
                    .metas
                    .iter()
                    .map(|m| self.segment_path_for_meta(m))
                    .collect(),
            },
        };
        Some(ReuploadCandidate {
            meta,
            replaced: run.replaced_bases(),
            source,
        })
    }

    /// Assemble local byte ranges covering the merged entry exactly, on
    /// batch boundaries. Returns `None` when local segments no longer
    /// cover the range.
    async fn build_local_source(&self, meta: &SegmentMeta) -> Option<ReuploadSource> {
        let mut sources = Vec::new();
        let mut locks = Vec::new();
        let mut expected = meta.base_offset;

        for segment in self.log.segments() {
            if expected > meta.committed_offset {
                break;
            }
            if segment.committed_offset < expected || segment.base_offset > expected {
                continue;
            }
            let lock = self.log.read_lock(&segment.name).await.ok()?;
            let included: Vec<_> = segment
                .batches
                .iter()
                .skip_while(|b| b.base_offset < expected)
                .take_while(|b| b.last_offset <= meta.committed_offset)
                .collect();
            let (first, last) = (included.first()?, included.last()?);
            if first.base_offset != expected {
                return None;
            }
            sources.push(SegmentSource {
                name: segment.name.clone(),
                byte_range: first.byte_offset..last.byte_offset + last.size_bytes,
            });
            locks.push(lock);
            expected = last.last_offset.next();
        }

        (expected == meta.committed_offset.next())
            .then_some(ReuploadSource::Local { sources, locks })
    }

    /// Upload an externally built reupload candidate. `source_chain`
    /// scopes cancellation to the caller when provided.
    pub async fn upload(
        &self,
        candidate: ReuploadCandidate,
        source_chain: Option<&coldstream_remote::RetryChain>,
    ) -> bool {
        let _guard = self.mutex.lock().await;
        let term = self.effective_term();
        if !self.can_update_archival_metadata(term) {
            return false;
        }
        let uploaded = self.do_reupload(term, candidate, source_chain).await;
        if uploaded {
            self.maybe_upload_manifest(term).await;
        }
        uploaded
    }

    pub(crate) async fn do_reupload(
        &self,
        term: Term,
        candidate: ReuploadCandidate,
        source_chain: Option<&coldstream_remote::RetryChain>,
    ) -> bool {
        let chain = source_chain.map_or_else(|| self.chain.child(), |c| c.child());
        let abort = self.lazy_abort(term);

        let payload = match &candidate.source {
            ReuploadSource::Local { sources, .. } => {
                let mut payload = Vec::new();
                for source in sources {
                    match self.log.read(&source.name, source.byte_range.clone()).await {
                        Ok(bytes) => payload.extend_from_slice(&bytes),
                        Err(e) => {
                            warn!(ntp = %self.ntp, segment = %source.name, error = %e,
                                  "reupload source read failed");
                            return false;
                        }
                    }
                }
                Bytes::from(payload)
            }
            ReuploadSource::Remote { keys } => {
                let mut payload = Vec::new();
                for key in keys {
                    let (result, bytes) = self.remote.download_object(&chain, &abort, key).await;
                    match bytes {
                        Some(bytes) => payload.extend_from_slice(&bytes),
                        None => {
                            warn!(ntp = %self.ntp, %key, %result, "reupload source download failed");
                            return false;
                        }
                    }
                }
                Bytes::from(payload)
            }
        };

        let mut meta = candidate.meta;
        meta.size_bytes = payload.len() as u64;
        meta.archiver_term = term;
        let path = self.segment_path_for_meta(&meta);

        if self.remote.upload_object(&chain, &abort, &path, payload).await != UploadResult::Success
        {
            warn!(ntp = %self.ntp, %path, "reupload PUT failed");
            return false;
        }
        self.probe.segment_uploaded(meta.size_bytes);

        match self
            .replicate_and_apply(
                term,
                ArchivalCommand::ReplaceSegments {
                    merged: meta,
                    replaced: candidate.replaced,
                },
            )
            .await
        {
            Ok(()) => true,
            Err(e) => {
                // The new blob is unreferenced and will be collected.
                warn!(ntp = %self.ntp, error = %e, "failed to replicate segment replacement");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coldstream_common::{InitialRevision, Ntp, Term};

    fn meta(base: u64, committed: u64, size: u64, max_timestamp: u64) -> SegmentMeta {
        SegmentMeta {
            base_offset: Offset::new(base),
            committed_offset: Offset::new(committed),
            base_timestamp: max_timestamp.saturating_sub(1000),
            max_timestamp,
            size_bytes: size,
            delta_offset: 0,
            archiver_term: Term::new(1),
            segment_term: Term::new(1),
            is_compacted: false,
            sname_format: 1,
        }
    }

    fn manifest(entries: &[(u64, u64, u64, u64)]) -> PartitionManifest {
        let mut m = PartitionManifest::new(Ntp::new("ns", "t", 0), InitialRevision::new(1));
        for (base, committed, size, ts) in entries {
            m.add(meta(*base, *committed, *size, *ts)).unwrap();
        }
        m
    }

    #[test]
    fn test_retention_by_size() {
        // 10k bytes total; keep at most 4k => drop the first three entries.
        let m = manifest(&[
            (0, 999, 3000, 100),
            (1000, 1999, 2000, 200),
            (2000, 2999, 2000, 300),
            (3000, 3999, 3000, 400),
        ]);
        let new_start = compute_retention_start(&m, Some(4000), None, 1_000_000).unwrap();
        assert_eq!(new_start, Offset::new(3000));
    }

    #[test]
    fn test_retention_by_time() {
        let m = manifest(&[(0, 999, 100, 1000), (1000, 1999, 100, 2000), (2000, 2999, 100, 9000)]);
        // Entries older than now-5000 = 3000 are dropped.
        let new_start = compute_retention_start(&m, None, Some(5000), 8000).unwrap();
        assert_eq!(new_start, Offset::new(2000));
    }

    #[test]
    fn test_retention_within_bounds_is_none() {
        let m = manifest(&[(0, 999, 100, 1000)]);
        assert!(compute_retention_start(&m, Some(1000), None, 2000).is_none());
        assert!(compute_retention_start(&m, None, Some(10_000), 2000).is_none());
        let empty = PartitionManifest::new(Ntp::new("ns", "t", 0), InitialRevision::new(1));
        assert!(compute_retention_start(&empty, Some(0), Some(0), 2000).is_none());
    }

    #[test]
    fn test_retention_combined_takes_max() {
        let m = manifest(&[
            (0, 999, 100, 1000),
            (1000, 1999, 100, 2000),
            (2000, 2999, 100, 9000),
        ]);
        // Time drops the first entry, size drops the first two.
        let new_start = compute_retention_start(&m, Some(100), Some(6500), 8000).unwrap();
        assert_eq!(new_start, Offset::new(2000));
    }

    #[test]
    fn test_adjacent_run_detection() {
        let m = manifest(&[
            (0, 999, 100, 1),
            (1000, 1999, 100, 2),
            (2000, 2999, 5000, 3),
        ]);
        let run = find_adjacent_run(&m, 1000).unwrap();
        assert_eq!(run.metas.len(), 2);
        assert_eq!(run.base_offset(), Offset::new(0));
        assert_eq!(run.committed_offset(), Offset::new(1999));
        assert_eq!(run.total_size_bytes(), 200);
    }

    #[test]
    fn test_adjacent_run_requires_two_small_entries() {
        let m = manifest(&[(0, 999, 100, 1), (1000, 1999, 5000, 2)]);
        assert!(find_adjacent_run(&m, 1000).is_none());
        let single = manifest(&[(0, 999, 100, 1)]);
        assert!(find_adjacent_run(&single, 1000).is_none());
    }

    #[test]
    fn test_adjacent_run_stops_at_target() {
        let m = manifest(&[
            (0, 999, 400, 1),
            (1000, 1999, 400, 2),
            (2000, 2999, 400, 3),
            (3000, 3999, 400, 4),
        ]);
        // Three entries fit under 1200; the fourth would exceed it.
        let run = find_adjacent_run(&m, 1200).unwrap();
        assert_eq!(run.metas.len(), 3);
        assert_eq!(run.committed_offset(), Offset::new(2999));
    }
}
