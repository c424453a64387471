//! In-memory replicated log
//!
//! Backs the archiver's unit tests: segments live in memory with
//! deterministic filler payloads, leadership and the stable offset are
//! set explicitly, and replication failures can be injected to exercise
//! mid-batch leadership loss.

use crate::command::ArchivalCommand;
use crate::log::{BatchMeta, LocalSegment, ReplicatedLog, SegmentReadLock};
use async_trait::async_trait;
use bytes::Bytes;
use coldstream_common::{Error, NodeId, Ntp, Offset, Result, Term};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One batch of a segment under construction
#[derive(Clone, Debug)]
pub struct BatchSpec {
    pub records: u64,
    pub size_bytes: u64,
    pub max_timestamp: u64,
    pub is_data: bool,
    pub is_transactional: bool,
}

impl BatchSpec {
    /// A data batch of `records` records occupying `size_bytes`.
    #[must_use]
    pub fn data(records: u64, size_bytes: u64) -> Self {
        Self {
            records,
            size_bytes,
            max_timestamp: 1_700_000_000_000,
            is_data: true,
            is_transactional: false,
        }
    }

    /// A control/configuration batch (non-data records).
    #[must_use]
    pub fn control(records: u64, size_bytes: u64) -> Self {
        Self {
            is_data: false,
            ..Self::data(records, size_bytes)
        }
    }

    #[must_use]
    pub fn at(mut self, max_timestamp: u64) -> Self {
        self.max_timestamp = max_timestamp;
        self
    }

    #[must_use]
    pub fn transactional(mut self) -> Self {
        self.is_transactional = true;
        self
    }
}

/// A segment under construction
#[derive(Clone, Debug)]
pub struct SegmentSpec {
    pub base_offset: u64,
    pub term: u64,
    pub delta_offset: u64,
    pub is_compacted: bool,
    pub batches: Vec<BatchSpec>,
    pub tx_metadata: Option<Bytes>,
}

impl SegmentSpec {
    #[must_use]
    pub fn new(base_offset: u64, term: u64) -> Self {
        Self {
            base_offset,
            term,
            delta_offset: 0,
            is_compacted: false,
            batches: Vec::new(),
            tx_metadata: None,
        }
    }

    /// Append a data batch of `records` records and `size_bytes` bytes.
    #[must_use]
    pub fn batch(mut self, records: u64, size_bytes: u64) -> Self {
        self.batches.push(BatchSpec::data(records, size_bytes));
        self
    }

    #[must_use]
    pub fn with_batch(mut self, batch: BatchSpec) -> Self {
        self.batches.push(batch);
        self
    }

    #[must_use]
    pub fn compacted(mut self) -> Self {
        self.is_compacted = true;
        self
    }

    #[must_use]
    pub fn with_delta(mut self, delta_offset: u64) -> Self {
        self.delta_offset = delta_offset;
        self
    }

    #[must_use]
    pub fn with_tx(mut self, tx_metadata: impl Into<Bytes>) -> Self {
        self.tx_metadata = Some(tx_metadata.into());
        self
    }
}

struct StoredSegment {
    meta: LocalSegment,
    payload: Bytes,
    tx_metadata: Option<Bytes>,
    lock: Arc<RwLock<()>>,
}

struct State {
    term: Term,
    leader: Option<NodeId>,
    lso_override: Option<Offset>,
    local_start: Offset,
    segments: BTreeMap<u64, StoredSegment>,
    stm_offset: u64,
    replicated: Vec<(u64, ArchivalCommand)>,
    /// Successful replicate calls remaining before injected failures
    replicate_budget: Option<u32>,
}

/// In-memory `ReplicatedLog` implementation
pub struct MemoryLog {
    ntp: Ntp,
    node_id: NodeId,
    state: Mutex<State>,
}

impl MemoryLog {
    #[must_use]
    pub fn new(ntp: Ntp, node_id: NodeId) -> Self {
        Self {
            ntp,
            node_id,
            state: Mutex::new(State {
                term: Term::new(0),
                leader: None,
                lso_override: None,
                local_start: Offset::new(0),
                segments: BTreeMap::new(),
                stm_offset: 0,
                replicated: Vec::new(),
                replicate_budget: None,
            }),
        }
    }

    /// Install a leader for a term. Pass this log's own node id to make
    /// the local replica the leader.
    pub fn set_leadership(&self, leader: Option<NodeId>, term: Term) {
        let mut state = self.state.lock();
        state.leader = leader;
        state.term = term;
    }

    /// Pin the last stable offset below the committed offset.
    pub fn set_lso(&self, lso: Offset) {
        self.state.lock().lso_override = Some(lso);
    }

    pub fn set_local_start(&self, offset: Offset) {
        self.state.lock().local_start = offset;
    }

    /// Let the next `calls` replicate calls succeed, then fail the rest
    /// with a leadership error.
    pub fn fail_replicate_after(&self, calls: u32) {
        self.state.lock().replicate_budget = Some(calls);
    }

    /// Materialize a segment from its spec.
    pub fn append_segment(&self, spec: SegmentSpec) {
        let mut batches = Vec::with_capacity(spec.batches.len());
        let mut next_offset = spec.base_offset;
        let mut byte_offset = 0u64;
        for batch in &spec.batches {
            batches.push(BatchMeta {
                base_offset: Offset::new(next_offset),
                last_offset: Offset::new(next_offset + batch.records - 1),
                byte_offset,
                size_bytes: batch.size_bytes,
                max_timestamp: batch.max_timestamp,
                is_data: batch.is_data,
                is_transactional: batch.is_transactional,
            });
            next_offset += batch.records;
            byte_offset += batch.size_bytes;
        }
        let committed = next_offset - 1;
        let meta = LocalSegment {
            name: format!("{}-{}.log", spec.base_offset, spec.term),
            base_offset: Offset::new(spec.base_offset),
            committed_offset: Offset::new(committed),
            segment_term: Term::new(spec.term),
            size_bytes: byte_offset,
            delta_offset: spec.delta_offset,
            is_compacted: spec.is_compacted,
            batches,
        };
        let payload = Bytes::from(vec![(spec.base_offset % 251) as u8; byte_offset as usize]);
        self.state.lock().segments.insert(
            spec.base_offset,
            StoredSegment {
                meta,
                payload,
                tx_metadata: spec.tx_metadata,
                lock: Arc::new(RwLock::new(())),
            },
        );
    }

    /// Try to evict a segment the way local retention would. Fails while
    /// an upload holds the segment's read lock.
    pub fn try_evict_segment(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        let base = state
            .segments
            .values()
            .find(|s| s.meta.name == name)
            .map(|s| s.meta.base_offset.get());
        let Some(base) = base else {
            return false;
        };
        if state.segments[&base].lock.try_write().is_err() {
            return false;
        }
        state.segments.remove(&base);
        true
    }

    /// Commands appended through this log, with their stm offsets.
    #[must_use]
    pub fn replicated_commands(&self) -> Vec<(u64, ArchivalCommand)> {
        self.state.lock().replicated.clone()
    }

    fn find_lock(&self, segment: &str) -> Result<Arc<RwLock<()>>> {
        self.state
            .lock()
            .segments
            .values()
            .find(|s| s.meta.name == segment)
            .map(|s| Arc::clone(&s.lock))
            .ok_or_else(|| Error::SegmentNotFound(segment.to_string()))
    }
}

#[async_trait]
impl ReplicatedLog for MemoryLog {
    fn ntp(&self) -> &Ntp {
        &self.ntp
    }

    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn term(&self) -> Term {
        self.state.lock().term
    }

    fn leader_id(&self) -> Option<NodeId> {
        self.state.lock().leader
    }

    fn committed_offset(&self) -> Offset {
        self.state
            .lock()
            .segments
            .values()
            .last()
            .map_or(Offset::new(0), |s| s.meta.committed_offset)
    }

    fn last_stable_offset(&self) -> Offset {
        let state = self.state.lock();
        state.lso_override.unwrap_or_else(|| {
            state
                .segments
                .values()
                .last()
                .map_or(Offset::new(0), |s| s.meta.committed_offset)
        })
    }

    fn local_start_offset(&self) -> Offset {
        self.state.lock().local_start
    }

    fn segments(&self) -> Vec<LocalSegment> {
        self.state
            .lock()
            .segments
            .values()
            .map(|s| s.meta.clone())
            .collect()
    }

    async fn read_lock(&self, segment: &str) -> Result<SegmentReadLock> {
        let lock = self.find_lock(segment)?;
        Ok(SegmentReadLock::new(lock.read_owned().await))
    }

    async fn read(&self, segment: &str, byte_range: Range<u64>) -> Result<Bytes> {
        let state = self.state.lock();
        let stored = state
            .segments
            .values()
            .find(|s| s.meta.name == segment)
            .ok_or_else(|| Error::SegmentNotFound(segment.to_string()))?;
        if byte_range.end > stored.payload.len() as u64 || byte_range.start > byte_range.end {
            return Err(Error::LocalRead(format!(
                "byte range {byte_range:?} out of bounds for {segment}"
            )));
        }
        Ok(stored
            .payload
            .slice(byte_range.start as usize..byte_range.end as usize))
    }

    async fn tx_metadata(&self, segment: &str) -> Result<Option<Bytes>> {
        let state = self.state.lock();
        let stored = state
            .segments
            .values()
            .find(|s| s.meta.name == segment)
            .ok_or_else(|| Error::SegmentNotFound(segment.to_string()))?;
        Ok(stored.tx_metadata.clone())
    }

    async fn replicate(&self, term: Term, commands: Vec<ArchivalCommand>) -> Result<u64> {
        let mut state = self.state.lock();
        if state.leader != Some(self.node_id) {
            return Err(Error::LeadershipLost);
        }
        if state.term != term {
            return Err(Error::TermChanged {
                started: term,
                current: state.term,
            });
        }
        if let Some(budget) = state.replicate_budget.as_mut() {
            if *budget == 0 {
                return Err(Error::LeadershipLost);
            }
            *budget -= 1;
        }
        for command in commands {
            state.stm_offset += 1;
            let offset = state.stm_offset;
            state.replicated.push((offset, command));
        }
        Ok(state.stm_offset)
    }
}
