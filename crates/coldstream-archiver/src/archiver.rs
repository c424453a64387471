//! The per-partition archiver worker
//!
//! While the local replica leads its replication group, the worker
//! selects upload candidates, PUTs them concurrently under the
//! configured parallelism bound, replicates manifest deltas in ascending
//! base-offset order and uploads the authoritative manifest copy. A
//! read-replica worker only mirrors the remote manifest.
//!
//! All mutating paths are serialized by the per-worker mutex; nothing
//! else writes to the archival state machine from this replica.

use crate::policy::{ArchivalPolicy, UploadCandidateWithLocks};
use crate::probe::ArchiverProbe;
use bytes::Bytes;
use coldstream_common::{
    ArchiverConfig, DownloadResult, Error, InitialRevision, NodeId, Ntp, Offset, RemoteKey,
    Result, Term, UploadKind, UploadResult,
};
use coldstream_manifest::codec;
use coldstream_manifest::{PartitionManifest, SegmentMeta, TopicManifest};
use coldstream_remote::paths::{self, ManifestFormat};
use coldstream_remote::{LazyAbort, Remote, RetryChain};
use coldstream_stm::{ArchivalCommand, ArchivalStm, ReplicatedLog, SegmentReadLock};
use futures::future::join_all;
use parking_lot::Mutex as SyncMutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Role of the worker for its partition replica
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiverRole {
    /// Leads uploads while the replica holds leadership
    Primary,
    /// Read replica: only pulls the remote manifest
    ReadReplica,
}

/// Upload counts for one kind within one iteration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UploadGroupResult {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Progress report of one `upload_next_candidates` iteration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub non_compacted: UploadGroupResult,
    pub compacted: UploadGroupResult,
}

impl BatchResult {
    #[must_use]
    pub fn total_succeeded(&self) -> usize {
        self.non_compacted.succeeded + self.compacted.succeeded
    }

    fn group_mut(&mut self, kind: UploadKind) -> &mut UploadGroupResult {
        match kind {
            UploadKind::NonCompacted => &mut self.non_compacted,
            UploadKind::Compacted => &mut self.compacted,
        }
    }
}

/// An offset window one upload context walks through
struct UploadContext {
    kind: UploadKind,
    start_offset: Offset,
    end_offset_exclusive: Offset,
    allow_reuploads: bool,
}

struct ScheduledUpload {
    kind: UploadKind,
    meta: SegmentMeta,
    path: RemoteKey,
    candidate: UploadCandidateWithLocks,
}

struct FinishedUpload {
    kind: UploadKind,
    meta: SegmentMeta,
    result: UploadResult,
    /// Held until the batch's manifest deltas are replicated.
    _locks: Vec<SegmentReadLock>,
}

/// Per-partition archival worker
pub struct NtpArchiver {
    pub(crate) ntp: Ntp,
    pub(crate) revision: InitialRevision,
    pub(crate) log: Arc<dyn ReplicatedLog>,
    pub(crate) remote: Remote,
    pub(crate) config: ArchiverConfig,
    role: ArchiverRole,
    policy: ArchivalPolicy,
    pub(crate) probe: Arc<ArchiverProbe>,
    pub(crate) stm: SyncMutex<ArchivalStm>,
    /// Serializes uploads, housekeeping and manifest sync for this worker.
    pub(crate) mutex: Mutex<()>,
    upload_sem: Arc<Semaphore>,
    /// Held while the inner loop body runs; leadership transfer waits on it.
    uploads_active: Arc<Semaphore>,
    paused: Arc<AtomicBool>,
    start_term: SyncMutex<Option<Term>>,
    pub(crate) chain: RetryChain,
    leader_notify: Notify,
    topic_manifest_dirty: AtomicBool,
    topic_config: SyncMutex<Option<TopicManifest>>,
    last_upload_time: SyncMutex<Option<Instant>>,
    next_housekeeping: SyncMutex<Instant>,
    tasks: SyncMutex<Vec<JoinHandle<()>>>,
}

impl NtpArchiver {
    pub fn new(
        log: Arc<dyn ReplicatedLog>,
        revision: InitialRevision,
        remote: Remote,
        config: ArchiverConfig,
        role: ArchiverRole,
    ) -> Arc<Self> {
        let ntp = log.ntp().clone();
        let probe = Arc::new(ArchiverProbe::new(&ntp));
        let stm = ArchivalStm::new(ntp.clone(), revision, config.max_segments_pending_deletion);
        let housekeeping_due = Instant::now()
            + jittered(Duration::from_millis(config.housekeeping_interval_ms));
        Arc::new(Self {
            policy: ArchivalPolicy::new(ntp.clone()),
            ntp,
            revision,
            log,
            remote,
            upload_sem: Arc::new(Semaphore::new(config.upload_concurrency)),
            config,
            role,
            probe,
            stm: SyncMutex::new(stm),
            mutex: Mutex::new(()),
            uploads_active: Arc::new(Semaphore::new(1)),
            paused: Arc::new(AtomicBool::new(false)),
            start_term: SyncMutex::new(None),
            chain: RetryChain::root(),
            leader_notify: Notify::new(),
            // Safe default after a crash: we cannot know whether the last
            // topic config change reached the store.
            topic_manifest_dirty: AtomicBool::new(true),
            topic_config: SyncMutex::new(None),
            last_upload_time: SyncMutex::new(None),
            next_housekeeping: SyncMutex::new(housekeeping_due),
            tasks: SyncMutex::new(Vec::new()),
        })
    }

    /// Install the topic configuration this worker may upload as the
    /// topic manifest. Only partition zero's worker ever uploads it.
    pub fn set_topic_config(&self, topic: TopicManifest) {
        *self.topic_config.lock() = Some(topic);
        self.topic_manifest_dirty.store(true, Ordering::SeqCst);
    }

    /// Spawn the background loop for this worker's role.
    pub fn start(self: &Arc<Self>) {
        let archiver = Arc::clone(self);
        let handle = tokio::spawn(async move {
            match archiver.role {
                ArchiverRole::Primary => archiver.upload_until_abort().await,
                ArchiverRole::ReadReplica => archiver.sync_manifest_until_abort().await,
            }
        });
        self.tasks.lock().push(handle);
        info!(ntp = %self.ntp, role = ?self.role, "archiver started");
    }

    /// Stop the worker and wait for its loops to finish.
    pub async fn stop(&self) {
        self.chain.cancel();
        self.leader_notify.notify_waiters();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        info!(ntp = %self.ntp, "archiver stopped");
    }

    #[must_use]
    pub fn get_ntp(&self) -> &Ntp {
        &self.ntp
    }

    #[must_use]
    pub fn get_revision_id(&self) -> InitialRevision {
        self.revision
    }

    #[must_use]
    pub fn get_last_upload_time(&self) -> Option<Instant> {
        *self.last_upload_time.lock()
    }

    #[must_use]
    pub fn probe(&self) -> &Arc<ArchiverProbe> {
        &self.probe
    }

    /// Snapshot of the manifest as currently known to this replica.
    #[must_use]
    pub fn manifest(&self) -> PartitionManifest {
        self.stm.lock().manifest().clone()
    }

    /// Sum of local segment bytes not yet covered by the manifest.
    #[must_use]
    pub fn estimate_backlog_size(&self) -> u64 {
        let next = self.stm.lock().manifest().next_upload_offset();
        self.log
            .segments()
            .iter()
            .filter(|s| s.committed_offset >= next)
            .map(|s| s.size_bytes)
            .sum()
    }

    /// Mark the topic manifest as needing re-upload.
    pub fn notify_topic_config(&self) {
        self.topic_manifest_dirty.store(true, Ordering::SeqCst);
    }

    /// Wake the upload loop if this replica just became the leader.
    pub fn notify_leadership(&self, new_leader: Option<NodeId>) {
        if new_leader == Some(self.log.node_id()) {
            self.leader_notify.notify_waiters();
        }
    }

    /// Quiesce uploads ahead of a leadership transfer.
    ///
    /// Flips the pause flag, then waits until the inner loop body has
    /// stopped. Returns false if the quiesce did not finish in time; the
    /// pause flag stays set either way until `complete_transfer_leadership`.
    pub async fn prepare_transfer_leadership(&self, deadline: Duration) -> bool {
        self.paused.store(true, Ordering::SeqCst);
        debug!(ntp = %self.ntp, "paused for leadership transfer");
        match tokio::time::timeout(deadline, self.uploads_active.acquire()).await {
            Ok(Ok(_permit)) => true,
            Ok(Err(_)) | Err(_) => {
                warn!(ntp = %self.ntp, "leadership transfer quiesce timed out");
                false
            }
        }
    }

    /// Resume normal operation after a leadership transfer attempt,
    /// whether or not it proceeded.
    pub fn complete_transfer_leadership(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.leader_notify.notify_waiters();
        debug!(ntp = %self.ntp, "leadership transfer complete, resuming");
    }

    /// True while archival metadata can still be replicated in `term`.
    pub(crate) fn can_update_archival_metadata(&self, term: Term) -> bool {
        !self.chain.is_cancelled() && self.log.is_leader() && self.log.term() == term
    }

    fn may_begin_uploads(&self, term: Term) -> bool {
        self.can_update_archival_metadata(term) && !self.paused.load(Ordering::SeqCst)
    }

    /// Term the current iteration runs under: the inner loop's starting
    /// term, or the log's current term for externally driven calls.
    pub(crate) fn effective_term(&self) -> Term {
        self.start_term.lock().unwrap_or_else(|| self.log.term())
    }

    /// Abort predicate handed to every remote operation of one iteration.
    pub(crate) fn lazy_abort(&self, term: Term) -> LazyAbort {
        let chain = self.chain.clone();
        let paused = Arc::clone(&self.paused);
        let log = Arc::clone(&self.log);
        LazyAbort::new(move || {
            if chain.is_cancelled() {
                Some("shutting down".to_string())
            } else if paused.load(Ordering::SeqCst) {
                Some("paused for leadership transfer".to_string())
            } else if !log.is_leader() {
                Some("lost leadership".to_string())
            } else if log.term() != term {
                Some(format!("term changed: {} -> {}", term, log.term()))
            } else {
                None
            }
        })
    }

    pub(crate) fn segment_path_for_meta(&self, meta: &SegmentMeta) -> RemoteKey {
        paths::segment_path(
            &self.ntp,
            self.revision,
            meta.base_offset,
            meta.committed_offset,
            meta.size_bytes,
            meta.segment_term,
            meta.archiver_term,
        )
    }

    /// Append one command through consensus and replay it locally.
    pub(crate) async fn replicate_and_apply(
        &self,
        term: Term,
        command: ArchivalCommand,
    ) -> Result<()> {
        let offset = self.log.replicate(term, vec![command.clone()]).await?;
        self.stm.lock().apply(offset, &command)
    }

    // ---- upload iteration -------------------------------------------------

    /// Upload the next set of segments, bounded by the last stable offset
    /// (or its override). One iteration: schedule up to the concurrency
    /// limit, await all PUTs, commit manifest deltas in ascending base
    /// offset order, then refresh the remote manifest copies.
    pub async fn upload_next_candidates(&self, lso_override: Option<Offset>) -> BatchResult {
        let _guard = self.mutex.lock().await;
        self.do_upload_next(lso_override).await
    }

    async fn do_upload_next(&self, lso_override: Option<Offset>) -> BatchResult {
        let term = self.effective_term();
        if !self.may_begin_uploads(term) {
            debug!(ntp = %self.ntp, "skipping upload iteration");
            return BatchResult::default();
        }
        let lso = lso_override.unwrap_or_else(|| self.log.last_stable_offset());
        let scheduled = self.schedule_uploads(term, lso).await;
        let result = if scheduled.is_empty() {
            BatchResult::default()
        } else {
            self.wait_all_scheduled_uploads(term, scheduled).await
        };

        // A previous iteration may have left the remote copies stale;
        // refresh them even when nothing new was uploaded.
        self.maybe_upload_topic_manifest(term).await;
        self.maybe_upload_manifest(term).await;

        self.probe.set_backlog_bytes(self.estimate_backlog_size());
        self.probe
            .set_pending_deletions(self.stm.lock().pending_deletions() as u64);
        result
    }

    /// Walk the upload contexts and collect up to the concurrency limit
    /// of candidates, acquiring their read locks.
    async fn schedule_uploads(&self, term: Term, lso: Offset) -> Vec<ScheduledUpload> {
        let (next_offset, start_offset) = {
            let stm = self.stm.lock();
            (
                stm.manifest().next_upload_offset(),
                stm.manifest().start_offset(),
            )
        };
        let mut contexts = vec![UploadContext {
            kind: UploadKind::NonCompacted,
            start_offset: next_offset,
            end_offset_exclusive: lso.next(),
            allow_reuploads: true,
        }];
        if self.config.segment_merging_enabled && start_offset < next_offset {
            contexts.push(UploadContext {
                kind: UploadKind::Compacted,
                start_offset,
                end_offset_exclusive: next_offset,
                allow_reuploads: false,
            });
        }

        let mut scheduled = Vec::new();
        for mut ctx in contexts {
            while scheduled.len() < self.config.upload_concurrency {
                let found = match self
                    .policy
                    .find_candidate(
                        self.log.as_ref(),
                        ctx.start_offset,
                        ctx.end_offset_exclusive,
                        ctx.kind,
                    )
                    .await
                {
                    Ok(Some(found)) => found,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(ntp = %self.ntp, error = %e, "candidate selection failed");
                        break;
                    }
                };
                ctx.start_offset = found.candidate.committed_offset.next();
                if !ctx.allow_reuploads && !self.is_worthwhile_reupload(&found) {
                    continue;
                }
                let meta = self.meta_for(term, &found);
                let path = self.segment_path_for_meta(&meta);
                scheduled.push(ScheduledUpload {
                    kind: ctx.kind,
                    meta,
                    path,
                    candidate: found,
                });
            }
        }
        scheduled
    }

    /// A compacted candidate is only uploaded when it lines up with an
    /// existing entry and actually shrinks or merges it.
    fn is_worthwhile_reupload(&self, found: &UploadCandidateWithLocks) -> bool {
        let stm = self.stm.lock();
        match stm.manifest().get(found.candidate.base_offset) {
            Some(existing) => {
                existing.committed_offset != found.candidate.committed_offset
                    || existing.size_bytes != found.candidate.size_bytes
            }
            None => false,
        }
    }

    fn meta_for(&self, term: Term, found: &UploadCandidateWithLocks) -> SegmentMeta {
        let c = &found.candidate;
        SegmentMeta {
            base_offset: c.base_offset,
            committed_offset: c.committed_offset,
            base_timestamp: c.base_timestamp,
            max_timestamp: c.max_timestamp,
            size_bytes: c.size_bytes,
            delta_offset: c.delta_offset,
            archiver_term: term,
            segment_term: c.segment_term,
            is_compacted: c.is_compacted,
            sname_format: 1,
        }
    }

    /// PUT one candidate (payload, then transaction metadata if any)
    /// under a concurrency permit.
    async fn upload_one(&self, term: Term, upload: ScheduledUpload) -> FinishedUpload {
        let ScheduledUpload {
            kind,
            meta,
            path,
            candidate,
        } = upload;
        let UploadCandidateWithLocks { candidate, locks } = candidate;

        let Ok(_permit) = self.upload_sem.acquire().await else {
            return FinishedUpload {
                kind,
                meta,
                result: UploadResult::Cancelled,
                _locks: locks,
            };
        };
        let abort = self.lazy_abort(term);
        let chain = self.chain.child();

        let mut payload = Vec::with_capacity(candidate.size_bytes as usize);
        for source in &candidate.sources {
            match self.log.read(&source.name, source.byte_range.clone()).await {
                Ok(bytes) => payload.extend_from_slice(&bytes),
                Err(e) => {
                    // The read locks should have kept these bytes alive.
                    error!(ntp = %self.ntp, segment = %source.name, error = %e,
                           "local read failed under read lock");
                    return FinishedUpload {
                        kind,
                        meta,
                        result: UploadResult::Failed,
                        _locks: locks,
                    };
                }
            }
        }

        let mut result = self
            .remote
            .upload_object(&chain, &abort, &path, Bytes::from(payload))
            .await;
        if result == UploadResult::Success && candidate.has_tx {
            result = self.upload_tx(&chain, &abort, &candidate, &path).await;
        }
        FinishedUpload {
            kind,
            meta,
            result,
            _locks: locks,
        }
    }

    async fn upload_tx(
        &self,
        chain: &RetryChain,
        abort: &LazyAbort,
        candidate: &crate::policy::UploadCandidate,
        segment_path: &RemoteKey,
    ) -> UploadResult {
        let source = &candidate.sources[0];
        match self.log.tx_metadata(&source.name).await {
            Ok(Some(tx)) if !tx.is_empty() => {
                self.remote
                    .upload_object(chain, abort, &paths::tx_path(segment_path), tx)
                    .await
            }
            Ok(_) => UploadResult::Success,
            Err(e) => {
                warn!(ntp = %self.ntp, segment = %source.name, error = %e,
                      "failed to read transaction metadata");
                UploadResult::Failed
            }
        }
    }

    /// Await all in-flight uploads, then commit manifest deltas for the
    /// successful ones in ascending base offset order. The first
    /// replication failure discards the rest of the batch; their blobs
    /// become garbage-collection candidates.
    async fn wait_all_scheduled_uploads(
        &self,
        term: Term,
        scheduled: Vec<ScheduledUpload>,
    ) -> BatchResult {
        let uploads = join_all(
            scheduled
                .into_iter()
                .map(|upload| self.upload_one(term, upload)),
        )
        .await;

        let mut result = BatchResult::default();
        for upload in &uploads {
            let group = result.group_mut(upload.kind);
            match upload.result {
                UploadResult::Success => {
                    group.succeeded += 1;
                    self.probe.segment_uploaded(upload.meta.size_bytes);
                }
                UploadResult::Failed | UploadResult::Timeout => {
                    group.failed += 1;
                    self.probe.upload_failed();
                }
                UploadResult::Cancelled => {
                    group.cancelled += 1;
                    self.probe.upload_cancelled();
                }
            }
        }

        let mut to_commit: Vec<&FinishedUpload> = uploads
            .iter()
            .filter(|u| u.result == UploadResult::Success)
            .collect();
        to_commit.sort_by_key(|u| u.meta.base_offset);

        for upload in to_commit {
            if !upload.meta.is_compacted {
                let expected = self.stm.lock().manifest().next_upload_offset();
                if upload.meta.base_offset > expected {
                    // A lower-offset upload failed; committing this entry
                    // would leave a gap. Its blob is collected later.
                    debug!(ntp = %self.ntp, base = %upload.meta.base_offset, %expected,
                           "holding back out-of-order manifest entry");
                    break;
                }
            }
            match self
                .replicate_and_apply(term, ArchivalCommand::AddSegment(upload.meta.clone()))
                .await
            {
                Ok(()) => {}
                Err(e) => {
                    warn!(ntp = %self.ntp, base = %upload.meta.base_offset, error = %e,
                          "failed to replicate manifest delta, discarding rest of batch");
                    break;
                }
            }
        }

        if result.total_succeeded() > 0 {
            *self.last_upload_time.lock() = Some(Instant::now());
        }
        result
    }

    /// Best-effort topic manifest upload from partition zero's worker.
    /// Clears the dirty flag only on success.
    async fn maybe_upload_topic_manifest(&self, term: Term) {
        if self.ntp.partition != 0 || !self.topic_manifest_dirty.load(Ordering::SeqCst) {
            return;
        }
        let Some(topic) = self.topic_config.lock().clone() else {
            return;
        };
        let payload = match topic.to_json() {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                warn!(ntp = %self.ntp, error = %e, "failed to encode topic manifest");
                return;
            }
        };
        let path = paths::topic_manifest_path(&self.ntp.namespace, &self.ntp.topic);
        let chain = self.chain.child();
        let abort = self.lazy_abort(term);
        match self.remote.upload_object(&chain, &abort, &path, payload).await {
            UploadResult::Success => {
                self.topic_manifest_dirty.store(false, Ordering::SeqCst);
                info!(ntp = %self.ntp, "uploaded topic manifest");
            }
            result => {
                warn!(ntp = %self.ntp, %result, "topic manifest upload failed, will retry");
            }
        }
    }

    /// Upload the authoritative partition manifest and mark the state
    /// machine clean. A terminal failure leaves the remote copy stale;
    /// the next iteration retries.
    pub(crate) async fn maybe_upload_manifest(&self, term: Term) {
        if !self.stm.lock().dirty() || !self.can_update_archival_metadata(term) {
            return;
        }
        let (payload, insync_offset) = {
            let stm = self.stm.lock();
            (codec::encode(stm.manifest()), stm.manifest().insync_offset())
        };
        let path = paths::partition_manifest_path(&self.ntp, self.revision, ManifestFormat::Binary);
        let chain = self.chain.child();
        let abort = self.lazy_abort(term);
        match self.remote.upload_object(&chain, &abort, &path, payload).await {
            UploadResult::Success => {
                self.probe.manifest_uploaded();
                if let Err(e) = self
                    .replicate_and_apply(term, ArchivalCommand::MarkClean { insync_offset })
                    .await
                {
                    warn!(ntp = %self.ntp, error = %e, "failed to replicate mark_clean");
                }
            }
            result => {
                warn!(ntp = %self.ntp, %result, "manifest upload failed, remote copy is stale");
            }
        }
    }

    // ---- manifest download ------------------------------------------------

    /// Fetch and parse the remote manifest. A missing manifest means "no
    /// remote state yet" and is reported as `NotFound`, not an error.
    pub async fn download_manifest(&self) -> (DownloadResult, Option<PartitionManifest>) {
        let chain = self.chain.child();
        let abort = LazyAbort::never();
        for format in [ManifestFormat::Binary, ManifestFormat::Json] {
            let path = paths::partition_manifest_path(&self.ntp, self.revision, format);
            let (result, payload) = self.remote.download_object(&chain, &abort, &path).await;
            match (result, payload) {
                (DownloadResult::Success, Some(payload)) => {
                    let decoded = match format {
                        ManifestFormat::Binary => codec::decode(&payload),
                        ManifestFormat::Json => PartitionManifest::from_json(&payload),
                    };
                    return match decoded {
                        Ok(manifest) => {
                            self.probe.manifest_downloaded();
                            (DownloadResult::Success, Some(manifest))
                        }
                        Err(e) => {
                            error!(ntp = %self.ntp, %path, error = %e,
                                   "failed to decode remote manifest");
                            (DownloadResult::Failed, None)
                        }
                    };
                }
                (DownloadResult::NotFound, _) => continue,
                (result, _) => return (result, None),
            }
        }
        (DownloadResult::NotFound, None)
    }

    /// Download the remote manifest and replay it into the local view.
    pub async fn sync_manifest(&self) -> DownloadResult {
        let _guard = self.mutex.lock().await;
        let (result, manifest) = self.download_manifest().await;
        if let Some(manifest) = manifest {
            let mut stm = self.stm.lock();
            if stm.reset_from_manifest(manifest) {
                debug!(ntp = %self.ntp, insync = stm.manifest().insync_offset(),
                       "adopted remote manifest");
            } else {
                warn!(ntp = %self.ntp, "remote manifest is older than local view, ignored");
            }
        }
        result
    }

    /// Probe the store for manifest entries whose local copies are gone
    /// and whose blobs are missing (disaster restore); truncate the
    /// manifest past them. Returns the new manifest when it changed.
    pub async fn maybe_truncate_manifest(&self) -> Result<Option<PartitionManifest>> {
        let _guard = self.mutex.lock().await;
        let term = self.effective_term();
        if !self.can_update_archival_metadata(term) {
            return Err(Error::LeadershipLost);
        }
        let local_start = self.log.local_start_offset();
        let below: Vec<SegmentMeta> = {
            let stm = self.stm.lock();
            stm.manifest()
                .iter()
                .take_while(|m| m.committed_offset < local_start)
                .cloned()
                .collect()
        };
        if below.is_empty() {
            return Ok(None);
        }
        let chain = self.chain.child();
        let mut missing = false;
        for meta in &below {
            let path = self.segment_path_for_meta(meta);
            if !self.remote.object_exists(&chain, &path).await? {
                warn!(ntp = %self.ntp, base = %meta.base_offset, %path,
                      "manifest entry has no remote blob");
                missing = true;
                break;
            }
        }
        if !missing {
            return Ok(None);
        }
        self.replicate_and_apply(
            term,
            ArchivalCommand::Truncate {
                new_start_offset: local_start,
            },
        )
        .await?;
        self.maybe_upload_manifest(term).await;
        Ok(Some(self.manifest()))
    }

    // ---- control loops ----------------------------------------------------

    pub(crate) fn housekeeping_due(&self) -> bool {
        Instant::now() >= *self.next_housekeeping.lock()
    }

    pub(crate) fn schedule_next_housekeeping(&self) {
        let interval = jittered(Duration::from_millis(self.config.housekeeping_interval_ms));
        *self.next_housekeeping.lock() = Instant::now() + interval;
    }

    /// Outer loop: wait for leadership, then archive until the term ends.
    async fn upload_until_abort(self: Arc<Self>) {
        loop {
            if self.chain.is_cancelled() {
                break;
            }
            if !self.log.is_leader() {
                // Wait for a leadership notification, with a poll fallback
                // in case the notification raced the check above.
                tokio::select! {
                    () = self.leader_notify.notified() => {}
                    () = self.chain.token().cancelled() => break,
                    () = tokio::time::sleep(Duration::from_millis(
                        self.config.upload_loop_max_backoff_ms)) => {}
                }
                continue;
            }
            self.upload_until_term_change().await;
        }
        debug!(ntp = %self.ntp, "upload loop exited");
    }

    /// Inner loop: keep uploading while still leader in the starting term
    /// and not paused.
    async fn upload_until_term_change(&self) {
        let term = self.log.term();
        *self.start_term.lock() = Some(term);
        info!(ntp = %self.ntp, %term, "starting archival in term");
        let initial = Duration::from_millis(self.config.upload_loop_initial_backoff_ms);
        let max = Duration::from_millis(self.config.upload_loop_max_backoff_ms);
        let mut backoff = initial;

        while self.can_update_archival_metadata(term) {
            if self.paused.load(Ordering::SeqCst) {
                tokio::select! {
                    () = tokio::time::sleep(initial) => {}
                    () = self.chain.token().cancelled() => break,
                }
                continue;
            }

            let made_progress;
            {
                let Ok(_active) = self.uploads_active.acquire().await else {
                    break;
                };
                let result = self.upload_next_candidates(None).await;
                made_progress = result.total_succeeded() > 0;
                if self.housekeeping_due() {
                    self.housekeeping().await;
                }
            }

            backoff = if made_progress {
                initial
            } else {
                (backoff * 2).min(max)
            };
            tokio::select! {
                () = tokio::time::sleep(jittered(backoff)) => {}
                () = self.chain.token().cancelled() => break,
            }
        }
        *self.start_term.lock() = None;
        info!(ntp = %self.ntp, %term, "leaving archival term");
    }

    /// Mirror loop for read replicas: periodically pull the remote
    /// manifest until aborted.
    async fn sync_manifest_until_abort(self: Arc<Self>) {
        let interval = Duration::from_millis(self.config.sync_manifest_timeout_ms);
        loop {
            if self.chain.is_cancelled() {
                break;
            }
            {
                let Ok(_active) = self.uploads_active.acquire().await else {
                    break;
                };
                let result = self.sync_manifest().await;
                debug!(ntp = %self.ntp, %result, "manifest sync");
            }
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = self.chain.token().cancelled() => break,
            }
        }
        debug!(ntp = %self.ntp, "manifest sync loop exited");
    }
}

/// Spread a duration by +/-25%.
fn jittered(base: Duration) -> Duration {
    base.mul_f64(rand::thread_rng().gen_range(0.75..=1.25))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::housekeeping::find_adjacent_run;
    use coldstream_remote::client::{MemoryObjectStore, ObjectStoreClient};
    use coldstream_remote::RetryPolicy;
    use coldstream_stm::{MemoryLog, SegmentSpec};

    fn test_config() -> ArchiverConfig {
        ArchiverConfig {
            upload_loop_initial_backoff_ms: 1,
            upload_loop_max_backoff_ms: 20,
            housekeeping_interval_ms: 60_000,
            ..ArchiverConfig::default()
        }
    }

    fn setup_with_config(
        config: ArchiverConfig,
    ) -> (Arc<MemoryLog>, Arc<MemoryObjectStore>, Arc<NtpArchiver>) {
        let ntp = Ntp::new("kafka", "events", 0);
        let log = Arc::new(MemoryLog::new(ntp, NodeId::new(1)));
        let store = Arc::new(MemoryObjectStore::new());
        let remote = Remote::new(
            Arc::clone(&store) as Arc<dyn ObjectStoreClient>,
            RetryPolicy {
                max_retries: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
            },
        );
        let archiver = NtpArchiver::new(
            Arc::clone(&log) as Arc<dyn ReplicatedLog>,
            InitialRevision::new(1),
            remote,
            config,
            ArchiverRole::Primary,
        );
        (log, store, archiver)
    }

    fn setup() -> (Arc<MemoryLog>, Arc<MemoryObjectStore>, Arc<NtpArchiver>) {
        setup_with_config(test_config())
    }

    fn make_leader(log: &MemoryLog, term: u64) {
        log.set_leadership(Some(NodeId::new(1)), Term::new(term));
    }

    fn segment_blob_count(store: &MemoryObjectStore) -> usize {
        store
            .keys()
            .iter()
            .filter(|k| k.contains(".log.") && !k.ends_with(".tx") && !k.ends_with(".index"))
            .count()
    }

    #[tokio::test]
    async fn test_happy_path_uploads_all_ready_segments() {
        let (log, store, archiver) = setup();
        for base in [0u64, 1000, 2000] {
            log.append_segment(SegmentSpec::new(base, 1).batch(1000, 4096));
        }
        make_leader(&log, 1);

        let result = archiver.upload_next_candidates(None).await;
        assert_eq!(
            result.non_compacted,
            UploadGroupResult {
                succeeded: 3,
                failed: 0,
                cancelled: 0
            }
        );

        let manifest = archiver.manifest();
        assert_eq!(manifest.len(), 3);
        assert_eq!(manifest.last_offset(), Some(Offset::new(2999)));
        for base in [0u64, 1000, 2000] {
            assert!(manifest.get(Offset::new(base)).is_some());
        }
        assert_eq!(segment_blob_count(&store), 3);
        assert!(store.keys().iter().any(|k| k.ends_with("manifest.bin")));

        // Three add_segment commands in ascending order, then mark_clean.
        let commands = log.replicated_commands();
        assert_eq!(commands.len(), 4);
        let bases: Vec<u64> = commands[..3]
            .iter()
            .map(|(_, c)| match c {
                ArchivalCommand::AddSegment(m) => m.base_offset.get(),
                other => panic!("unexpected command: {other:?}"),
            })
            .collect();
        assert_eq!(bases, vec![0, 1000, 2000]);
        assert!(matches!(commands[3].1, ArchivalCommand::MarkClean { .. }));
        assert!(archiver.get_last_upload_time().is_some());
    }

    #[tokio::test]
    async fn test_prefix_upload_starts_at_expected_offset() {
        let (log, _store, archiver) = setup();
        log.append_segment(SegmentSpec::new(0, 1).batch(501, 1002).batch(500, 1000));
        make_leader(&log, 1);

        // First iteration is LSO-bounded to 500: only the first batch.
        let result = archiver
            .upload_next_candidates(Some(Offset::new(500)))
            .await;
        assert_eq!(result.non_compacted.succeeded, 1);
        assert_eq!(archiver.manifest().last_offset(), Some(Offset::new(500)));

        // The next candidate is a mid-segment prefix beginning at 501.
        let result = archiver.upload_next_candidates(None).await;
        assert_eq!(result.non_compacted.succeeded, 1);
        let manifest = archiver.manifest();
        let entry = manifest.get(Offset::new(501)).unwrap();
        assert_eq!(entry.committed_offset, Offset::new(1000));
        assert_eq!(entry.size_bytes, 1000);
        assert_eq!(manifest.len(), 2);
    }

    #[tokio::test]
    async fn test_lso_cutoff_truncates_candidate() {
        let (log, _store, archiver) = setup();
        log.append_segment(
            SegmentSpec::new(2000, 1)
                .batch(500, 1000)
                .batch(500, 1000)
                .batch(500, 1000),
        );
        log.set_lso(Offset::new(3200));
        make_leader(&log, 1);

        let result = archiver.upload_next_candidates(None).await;
        assert_eq!(result.non_compacted.succeeded, 1);
        let manifest = archiver.manifest();
        let entry = manifest.get(Offset::new(2000)).unwrap();
        // Truncated to the last batch fully below the LSO.
        assert_eq!(entry.committed_offset, Offset::new(2999));
        assert_eq!(entry.size_bytes, 2000);
    }

    #[tokio::test]
    async fn test_concurrency_cap_bounds_each_iteration() {
        let config = ArchiverConfig {
            upload_concurrency: 2,
            ..test_config()
        };
        let (log, _store, archiver) = setup_with_config(config);
        for base in (0..5000u64).step_by(1000) {
            log.append_segment(SegmentSpec::new(base, 1).batch(1000, 1024));
        }
        make_leader(&log, 1);

        let result = archiver.upload_next_candidates(None).await;
        assert_eq!(result.non_compacted.succeeded, 2);
        assert_eq!(archiver.manifest().len(), 2);

        // The next iterations pick up the remaining three.
        let result = archiver.upload_next_candidates(None).await;
        assert_eq!(result.non_compacted.succeeded, 2);
        let result = archiver.upload_next_candidates(None).await;
        assert_eq!(result.non_compacted.succeeded, 1);
        assert_eq!(archiver.manifest().last_offset(), Some(Offset::new(4999)));
    }

    #[tokio::test]
    async fn test_replication_failure_orphans_are_collected() {
        let (log, store, archiver) = setup();
        for base in [0u64, 1000, 2000] {
            log.append_segment(SegmentSpec::new(base, 1).batch(1000, 4096));
        }
        make_leader(&log, 1);
        // The first add_segment replicates, the rest of the batch fails.
        log.fail_replicate_after(1);

        let result = archiver.upload_next_candidates(None).await;
        // All three blobs were PUT before replication stopped.
        assert_eq!(result.non_compacted.succeeded, 3);
        assert_eq!(segment_blob_count(&store), 3);
        assert_eq!(archiver.manifest().len(), 1);

        // The new leader's GC diffs the bucket against the manifest and
        // deletes the two uncommitted blobs.
        make_leader(&log, 2);
        log.fail_replicate_after(1000);
        archiver.garbage_collect().await;
        assert_eq!(segment_blob_count(&store), 1);
        assert_eq!(archiver.probe().deleted_segments(), 2);
    }

    #[tokio::test]
    async fn test_retention_then_gc_deletes_old_blobs() {
        let config = ArchiverConfig {
            retention_bytes: Some(4000),
            ..test_config()
        };
        let (log, store, archiver) = setup_with_config(config);
        for (base, size) in [(0u64, 3000u64), (1000, 2000), (2000, 2000), (3000, 3000)] {
            log.append_segment(SegmentSpec::new(base, 1).batch(1000, size));
        }
        make_leader(&log, 1);

        let result = archiver.upload_next_candidates(None).await;
        assert_eq!(result.non_compacted.succeeded, 4);
        assert_eq!(segment_blob_count(&store), 4);

        archiver.apply_retention().await;
        let manifest = archiver.manifest();
        assert_eq!(manifest.start_offset(), Offset::new(3000));
        assert_eq!(manifest.len(), 1);
        assert!(manifest.total_size_bytes() <= 4000);

        archiver.garbage_collect().await;
        assert_eq!(segment_blob_count(&store), 1);
        assert_eq!(archiver.probe().deleted_segments(), 3);
    }

    #[tokio::test]
    async fn test_upload_next_is_idempotent_when_caught_up() {
        let (log, store, archiver) = setup();
        log.append_segment(SegmentSpec::new(0, 1).batch(1000, 4096));
        make_leader(&log, 1);

        assert_eq!(archiver.upload_next_candidates(None).await.non_compacted.succeeded, 1);
        let manifest_before = archiver.manifest();
        let blobs_before = store.len();

        let result = archiver.upload_next_candidates(None).await;
        assert_eq!(result, BatchResult::default());
        assert_eq!(archiver.manifest(), manifest_before);
        assert_eq!(store.len(), blobs_before);
    }

    #[tokio::test]
    async fn test_transactional_segment_uploads_tx_blob() {
        let (log, store, archiver) = setup();
        log.append_segment(
            SegmentSpec::new(0, 1)
                .with_batch(coldstream_stm::BatchSpec::data(1000, 4096).transactional())
                .with_tx(&b"tx-ranges"[..]),
        );
        make_leader(&log, 1);

        let result = archiver.upload_next_candidates(None).await;
        assert_eq!(result.non_compacted.succeeded, 1);
        assert!(store.keys().iter().any(|k| k.ends_with(".tx")));
    }

    #[tokio::test]
    async fn test_compacted_segment_is_reuploaded() {
        let (log, store, archiver) = setup();
        log.append_segment(SegmentSpec::new(0, 1).batch(1000, 2000));
        make_leader(&log, 1);
        assert_eq!(archiver.upload_next_candidates(None).await.non_compacted.succeeded, 1);

        // Local compaction rewrites the segment to 800 bytes.
        log.append_segment(SegmentSpec::new(0, 1).batch(1000, 800).compacted());
        let result = archiver.upload_next_candidates(None).await;
        assert_eq!(result.compacted.succeeded, 1);
        assert_eq!(result.non_compacted.succeeded, 0);

        let manifest = archiver.manifest();
        let entry = manifest.get(Offset::new(0)).unwrap();
        assert!(entry.is_compacted);
        assert_eq!(entry.size_bytes, 800);

        // The superseded blob is queued for deletion and collected.
        archiver.garbage_collect().await;
        assert_eq!(segment_blob_count(&store), 1);
    }

    #[tokio::test]
    async fn test_housekeeping_merges_adjacent_small_segments() {
        let (log, store, archiver) = setup();
        log.append_segment(SegmentSpec::new(0, 1).batch(100, 100));
        log.append_segment(SegmentSpec::new(100, 1).batch(100, 100));
        make_leader(&log, 1);
        assert_eq!(archiver.upload_next_candidates(None).await.non_compacted.succeeded, 2);

        archiver.housekeeping().await;

        let manifest = archiver.manifest();
        assert_eq!(manifest.len(), 1);
        let entry = manifest.get(Offset::new(0)).unwrap();
        assert!(entry.is_compacted);
        assert_eq!(entry.committed_offset, Offset::new(199));
        assert_eq!(entry.size_bytes, 200);

        // The replaced blobs drain from the deletion queue next pass.
        archiver.garbage_collect().await;
        assert_eq!(segment_blob_count(&store), 1);
    }

    #[tokio::test]
    async fn test_find_reupload_candidate_and_upload() {
        let (log, _store, archiver) = setup();
        log.append_segment(SegmentSpec::new(0, 1).batch(100, 100));
        log.append_segment(SegmentSpec::new(100, 1).batch(100, 100));
        make_leader(&log, 1);
        archiver.upload_next_candidates(None).await;

        let candidate = archiver
            .find_reupload_candidate(|_, manifest| find_adjacent_run(manifest, 1 << 20))
            .await
            .unwrap();
        assert_eq!(candidate.meta.base_offset, Offset::new(0));
        assert_eq!(candidate.replaced.len(), 2);
        assert!(archiver.upload(candidate, None).await);
        assert_eq!(archiver.manifest().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_manifest_mirrors_remote_state() {
        let (log, store, archiver) = setup();
        log.append_segment(SegmentSpec::new(0, 1).batch(1000, 4096));
        make_leader(&log, 1);
        archiver.upload_next_candidates(None).await;
        let uploaded = archiver.manifest();

        // A read replica of the same partition pulls the manifest.
        let replica_log = Arc::new(MemoryLog::new(Ntp::new("kafka", "events", 0), NodeId::new(2)));
        let remote = Remote::new(
            Arc::clone(&store) as Arc<dyn ObjectStoreClient>,
            RetryPolicy::default(),
        );
        let replica = NtpArchiver::new(
            replica_log as Arc<dyn ReplicatedLog>,
            InitialRevision::new(1),
            remote,
            test_config(),
            ArchiverRole::ReadReplica,
        );
        assert_eq!(replica.sync_manifest().await, DownloadResult::Success);
        let mirrored = replica.manifest();
        assert_eq!(mirrored.len(), uploaded.len());
        assert_eq!(mirrored.last_offset(), uploaded.last_offset());
        assert_eq!(mirrored.insync_offset(), uploaded.insync_offset());
    }

    #[tokio::test]
    async fn test_sync_manifest_without_remote_state() {
        let (_log, _store, archiver) = setup();
        assert_eq!(archiver.sync_manifest().await, DownloadResult::NotFound);
        assert!(archiver.manifest().is_empty());
    }

    #[tokio::test]
    async fn test_prepare_transfer_leadership_quiesces_uploads() {
        let (log, store, archiver) = setup();
        log.append_segment(SegmentSpec::new(0, 1).batch(1000, 4096));
        make_leader(&log, 1);

        assert!(
            archiver
                .prepare_transfer_leadership(Duration::from_millis(200))
                .await
        );
        // Paused: the iteration refuses to start new uploads.
        let result = archiver.upload_next_candidates(None).await;
        assert_eq!(result, BatchResult::default());
        assert!(store.is_empty());

        archiver.complete_transfer_leadership();
        let result = archiver.upload_next_candidates(None).await;
        assert_eq!(result.non_compacted.succeeded, 1);
    }

    #[tokio::test]
    async fn test_upload_refused_without_leadership() {
        let (log, store, archiver) = setup();
        log.append_segment(SegmentSpec::new(0, 1).batch(1000, 4096));

        let result = archiver.upload_next_candidates(None).await;
        assert_eq!(result, BatchResult::default());
        assert!(store.is_empty());

        // Another node's leadership does not wake this worker into action.
        log.set_leadership(Some(NodeId::new(9)), Term::new(1));
        let result = archiver.upload_next_candidates(None).await;
        assert_eq!(result, BatchResult::default());
    }

    #[tokio::test]
    async fn test_failed_upload_does_not_commit_higher_offsets() {
        let (log, store, archiver) = setup();
        for base in [0u64, 1000, 2000] {
            log.append_segment(SegmentSpec::new(base, 1).batch(1000, 4096));
        }
        make_leader(&log, 1);
        // The middle segment's PUT exhausts its retries.
        let middle = paths::segment_path(
            archiver.get_ntp(),
            archiver.get_revision_id(),
            Offset::new(1000),
            Offset::new(1999),
            4096,
            Term::new(1),
            Term::new(1),
        );
        store.fail_next_puts(middle.as_str().to_string(), 10);

        let result = archiver.upload_next_candidates(None).await;
        assert_eq!(result.non_compacted.succeeded, 2);
        assert_eq!(result.non_compacted.failed, 1);

        // Offset 0 committed; 2000 held back to avoid a manifest gap.
        let manifest = archiver.manifest();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.last_offset(), Some(Offset::new(999)));
    }

    #[tokio::test]
    async fn test_estimate_backlog_size() {
        let (log, _store, archiver) = setup();
        log.append_segment(SegmentSpec::new(0, 1).batch(1000, 1000));
        log.append_segment(SegmentSpec::new(1000, 1).batch(1000, 3000));
        make_leader(&log, 1);
        assert_eq!(archiver.estimate_backlog_size(), 4000);

        archiver.upload_next_candidates(Some(Offset::new(999))).await;
        assert_eq!(archiver.estimate_backlog_size(), 3000);
    }

    #[tokio::test]
    async fn test_maybe_truncate_manifest_drops_lost_entries() {
        let (log, store, archiver) = setup();
        log.append_segment(SegmentSpec::new(0, 1).batch(1000, 1000));
        log.append_segment(SegmentSpec::new(1000, 1).batch(1000, 1000));
        make_leader(&log, 1);
        archiver.upload_next_candidates(None).await;

        // Disaster: the first entry's blob vanished from the bucket and
        // the local log no longer reaches below offset 1000.
        let manifest = archiver.manifest();
        let lost = manifest.get(Offset::new(0)).unwrap();
        store.delete(&archiver.segment_path_for_meta(lost)).await.unwrap();
        log.set_local_start(Offset::new(1000));

        let truncated = archiver.maybe_truncate_manifest().await.unwrap().unwrap();
        assert_eq!(truncated.start_offset(), Offset::new(1000));
        assert_eq!(truncated.len(), 1);

        // Nothing below the local start: a second probe is a no-op.
        assert!(archiver.maybe_truncate_manifest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_topic_manifest_uploaded_from_partition_zero() {
        let (log, store, archiver) = setup();
        archiver.set_topic_config(TopicManifest {
            namespace: "kafka".to_string(),
            topic: "events".to_string(),
            partition_count: 1,
            revision: InitialRevision::new(1),
            retention_bytes: None,
            retention_ms: None,
        });
        log.append_segment(SegmentSpec::new(0, 1).batch(1000, 1000));
        make_leader(&log, 1);

        archiver.upload_next_candidates(None).await;
        assert!(
            store
                .keys()
                .iter()
                .any(|k| k.ends_with("topic_manifest.json"))
        );

        // Clean flag: a further iteration does not re-upload.
        let before = store.len();
        archiver.upload_next_candidates(None).await;
        assert_eq!(store.len(), before);
    }

    #[tokio::test]
    async fn test_background_loop_uploads_on_leadership() {
        let (log, _store, archiver) = setup();
        log.append_segment(SegmentSpec::new(0, 1).batch(1000, 4096));
        archiver.start();

        make_leader(&log, 1);
        archiver.notify_leadership(Some(NodeId::new(1)));

        let deadline = Instant::now() + Duration::from_secs(5);
        while archiver.manifest().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(archiver.manifest().len(), 1);
        archiver.stop().await;

        // After stop, iterations refuse to run.
        let result = archiver.upload_next_candidates(None).await;
        assert_eq!(result, BatchResult::default());
    }

    #[tokio::test]
    async fn test_mirror_loop_follows_remote_manifest() {
        let (log, store, archiver) = setup();
        log.append_segment(SegmentSpec::new(0, 1).batch(1000, 4096));
        make_leader(&log, 1);
        archiver.upload_next_candidates(None).await;

        let replica_log = Arc::new(MemoryLog::new(Ntp::new("kafka", "events", 0), NodeId::new(2)));
        let remote = Remote::new(
            Arc::clone(&store) as Arc<dyn ObjectStoreClient>,
            RetryPolicy::default(),
        );
        let replica = NtpArchiver::new(
            replica_log as Arc<dyn ReplicatedLog>,
            InitialRevision::new(1),
            remote,
            ArchiverConfig {
                sync_manifest_timeout_ms: 10,
                ..test_config()
            },
            ArchiverRole::ReadReplica,
        );
        replica.start();

        let deadline = Instant::now() + Duration::from_secs(5);
        while replica.manifest().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(replica.manifest().len(), 1);
        replica.stop().await;
    }
}
