//! Partition manifest
//!
//! Ordered mapping from base offset to remote segment metadata, plus the
//! retention lower bound and the state-machine offset that produced the
//! current view. The manifest is only mutated by replaying archival
//! commands; the uploader never writes to it directly.

use coldstream_common::{Error, InitialRevision, Ntp, Offset, Result, Term};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata of one uploaded segment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMeta {
    /// First offset covered by the segment, inclusive
    pub base_offset: Offset,
    /// Last offset covered by the segment, inclusive
    pub committed_offset: Offset,
    /// Wall-clock bound of the first batch (ms since epoch)
    pub base_timestamp: u64,
    /// Wall-clock bound of the last batch (ms since epoch)
    pub max_timestamp: u64,
    /// Payload length in the object store
    pub size_bytes: u64,
    /// Non-data record count preceding `base_offset`
    pub delta_offset: u64,
    /// Term in which the segment was uploaded
    pub archiver_term: Term,
    /// Term in which the segment's batches were written
    pub segment_term: Term,
    /// Whether this entry replaces several earlier entries
    pub is_compacted: bool,
    /// Key-naming scheme version
    pub sname_format: u8,
}

/// Outcome of adding an entry to the manifest
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddResult {
    /// The entry was inserted; compacted entries may have subsumed older ones.
    Added { replaced: Vec<SegmentMeta> },
    /// An identical entry was already present; nothing changed.
    Identical,
}

/// Authoritative description of a partition's uploaded segments
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionManifest {
    ntp: Ntp,
    revision: InitialRevision,
    start_offset: Offset,
    last_offset: Option<Offset>,
    insync_offset: u64,
    entries: BTreeMap<u64, SegmentMeta>,
}

impl PartitionManifest {
    #[must_use]
    pub fn new(ntp: Ntp, revision: InitialRevision) -> Self {
        Self {
            ntp,
            revision,
            start_offset: Offset::default(),
            last_offset: None,
            insync_offset: 0,
            entries: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn ntp(&self) -> &Ntp {
        &self.ntp
    }

    #[must_use]
    pub fn revision(&self) -> InitialRevision {
        self.revision
    }

    /// Retention lower bound; entries below it are deletable.
    #[must_use]
    pub fn start_offset(&self) -> Offset {
        self.start_offset
    }

    /// Max committed offset covered, `None` while the manifest is empty.
    #[must_use]
    pub fn last_offset(&self) -> Option<Offset> {
        self.last_offset
    }

    /// Latest state-machine offset that produced this view.
    #[must_use]
    pub fn insync_offset(&self) -> u64 {
        self.insync_offset
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of payload sizes of all retained entries.
    #[must_use]
    pub fn total_size_bytes(&self) -> u64 {
        self.entries.values().map(|m| m.size_bytes).sum()
    }

    /// Entries ordered by base offset.
    pub fn iter(&self) -> impl Iterator<Item = &SegmentMeta> {
        self.entries.values()
    }

    /// Lookup by exact base offset.
    #[must_use]
    pub fn get(&self, base_offset: Offset) -> Option<&SegmentMeta> {
        self.entries.get(&base_offset.get())
    }

    /// The retained entry whose offset range contains `offset`.
    #[must_use]
    pub fn find_containing(&self, offset: Offset) -> Option<&SegmentMeta> {
        if offset < self.start_offset {
            return None;
        }
        self.entries
            .range(..=offset.get())
            .next_back()
            .map(|(_, meta)| meta)
            .filter(|meta| meta.committed_offset >= offset)
    }

    /// Offset the next non-compacted upload must start at.
    #[must_use]
    pub fn next_upload_offset(&self) -> Offset {
        match self.last_offset {
            Some(last) => last.next(),
            None => self.start_offset,
        }
    }

    /// Add an uploaded segment's metadata.
    ///
    /// Idempotent under base-offset equality: re-adding an identical entry
    /// is a no-op, a differing entry at the same base offset is a conflict.
    /// A non-compacted entry must continue the log exactly where the
    /// manifest ends; a compacted entry may subsume a contiguous run of
    /// existing entries that it fully covers.
    pub fn add(&mut self, meta: SegmentMeta) -> Result<AddResult> {
        if meta.committed_offset < meta.base_offset {
            return Err(Error::ManifestConflict {
                base_offset: meta.base_offset.get(),
            });
        }
        if let Some(existing) = self.entries.get(&meta.base_offset.get()) {
            if *existing == meta {
                return Ok(AddResult::Identical);
            }
            if !meta.is_compacted {
                return Err(Error::ManifestConflict {
                    base_offset: meta.base_offset.get(),
                });
            }
        }

        let replaced = if meta.is_compacted {
            self.subsume(&meta)?
        } else {
            if let Some(last) = self.last_offset {
                if meta.base_offset != last.next() {
                    return Err(Error::ManifestConflict {
                        base_offset: meta.base_offset.get(),
                    });
                }
            } else if meta.base_offset < self.start_offset {
                return Err(Error::ManifestConflict {
                    base_offset: meta.base_offset.get(),
                });
            }
            Vec::new()
        };

        if self.entries.is_empty() && self.start_offset == Offset::default() {
            self.start_offset = meta.base_offset;
        }
        self.last_offset = Some(match self.last_offset {
            Some(last) => last.max(meta.committed_offset),
            None => meta.committed_offset,
        });
        self.entries.insert(meta.base_offset.get(), meta);
        Ok(AddResult::Added { replaced })
    }

    /// Remove existing entries fully covered by a compacted entry. Entries
    /// partially overlapping its range are a conflict.
    fn subsume(&mut self, meta: &SegmentMeta) -> Result<Vec<SegmentMeta>> {
        let overlapping: Vec<u64> = self
            .entries
            .values()
            .filter(|e| {
                e.base_offset <= meta.committed_offset && e.committed_offset >= meta.base_offset
            })
            .map(|e| e.base_offset.get())
            .collect();
        for base in &overlapping {
            let e = &self.entries[base];
            if e.base_offset < meta.base_offset || e.committed_offset > meta.committed_offset {
                return Err(Error::ManifestConflict {
                    base_offset: meta.base_offset.get(),
                });
            }
        }
        let mut removed = Vec::with_capacity(overlapping.len());
        for base in overlapping {
            let Some(old) = self.entries.remove(&base) else {
                continue;
            };
            // The old version at the merged entry's own base offset is
            // surfaced too, so its blob can be collected.
            if old != *meta {
                removed.push(old);
            }
        }
        Ok(removed)
    }

    /// Advance the retention lower bound, dropping entries wholly below it.
    /// Returns the dropped entries; a non-advancing call is a no-op.
    pub fn truncate(&mut self, new_start_offset: Offset) -> Vec<SegmentMeta> {
        if new_start_offset <= self.start_offset {
            return Vec::new();
        }
        let dropped: Vec<u64> = self
            .entries
            .values()
            .take_while(|m| m.committed_offset < new_start_offset)
            .map(|m| m.base_offset.get())
            .collect();
        let dropped: Vec<SegmentMeta> = dropped
            .iter()
            .filter_map(|base| self.entries.remove(base))
            .collect();
        self.start_offset = new_start_offset;
        dropped
    }

    /// Replace a contiguous run of entries with one merged entry.
    ///
    /// The merged entry must cover exactly the run's offset range. Returns
    /// the replaced entries.
    pub fn replace(
        &mut self,
        merged: SegmentMeta,
        replaced_bases: &[Offset],
    ) -> Result<Vec<SegmentMeta>> {
        if replaced_bases.is_empty() {
            return Err(Error::ManifestConflict {
                base_offset: merged.base_offset.get(),
            });
        }
        let mut expected = None;
        for base in replaced_bases {
            let entry = self.entries.get(&base.get()).ok_or(Error::ManifestConflict {
                base_offset: base.get(),
            })?;
            if let Some(expected) = expected {
                if entry.base_offset != expected {
                    return Err(Error::ManifestConflict {
                        base_offset: base.get(),
                    });
                }
            }
            expected = Some(entry.committed_offset.next());
        }
        let first = replaced_bases[0];
        let last_committed = expected.map(|o| o.prev()).unwrap_or(first);
        if merged.base_offset != first || merged.committed_offset != last_committed {
            return Err(Error::ManifestConflict {
                base_offset: merged.base_offset.get(),
            });
        }

        let removed: Vec<SegmentMeta> = replaced_bases
            .iter()
            .filter_map(|base| self.entries.remove(&base.get()))
            .collect();
        self.entries.insert(merged.base_offset.get(), merged);
        Ok(removed)
    }

    /// Advance the state-machine offset. Never goes backwards.
    pub fn advance_insync(&mut self, insync_offset: u64) {
        self.insync_offset = self.insync_offset.max(insync_offset);
    }

    /// JSON flavor of the manifest.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::ManifestCodec(e.to_string()))
    }

    pub fn from_json(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| Error::ManifestCodec(e.to_string()))
    }

    /// Rebuild a manifest from decoded parts. Used by the binary codec;
    /// entries are trusted and inserted without invariant checks.
    pub(crate) fn from_parts(
        ntp: Ntp,
        revision: InitialRevision,
        start_offset: Offset,
        last_offset: Option<Offset>,
        insync_offset: u64,
        entries: Vec<SegmentMeta>,
    ) -> Self {
        Self {
            ntp,
            revision,
            start_offset,
            last_offset,
            insync_offset,
            entries: entries
                .into_iter()
                .map(|m| (m.base_offset.get(), m))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn meta(base: u64, committed: u64, size: u64) -> SegmentMeta {
        SegmentMeta {
            base_offset: Offset::new(base),
            committed_offset: Offset::new(committed),
            base_timestamp: 1_700_000_000_000,
            max_timestamp: 1_700_000_100_000,
            size_bytes: size,
            delta_offset: 0,
            archiver_term: Term::new(1),
            segment_term: Term::new(1),
            is_compacted: false,
            sname_format: 1,
        }
    }

    fn manifest() -> PartitionManifest {
        PartitionManifest::new(Ntp::new("kafka", "events", 0), InitialRevision::new(5))
    }

    #[test]
    fn test_add_contiguous_entries() {
        let mut m = manifest();
        assert!(matches!(
            m.add(meta(0, 999, 100)).unwrap(),
            AddResult::Added { .. }
        ));
        m.add(meta(1000, 1999, 100)).unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m.last_offset(), Some(Offset::new(1999)));
        assert_eq!(m.next_upload_offset(), Offset::new(2000));
        assert_eq!(m.total_size_bytes(), 200);
    }

    #[test]
    fn test_add_rejects_gap_and_overlap() {
        let mut m = manifest();
        m.add(meta(0, 999, 100)).unwrap();
        assert!(m.add(meta(1500, 1999, 100)).is_err());
        assert!(m.add(meta(500, 1999, 100)).is_err());
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut m = manifest();
        m.add(meta(0, 999, 100)).unwrap();
        assert_eq!(m.add(meta(0, 999, 100)).unwrap(), AddResult::Identical);
        assert!(m.add(meta(0, 999, 200)).is_err());
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_compacted_add_subsumes_covered_entries() {
        let mut m = manifest();
        m.add(meta(0, 999, 100)).unwrap();
        m.add(meta(1000, 1999, 100)).unwrap();
        m.add(meta(2000, 2999, 100)).unwrap();

        let mut merged = meta(0, 1999, 150);
        merged.is_compacted = true;
        let AddResult::Added { replaced } = m.add(merged).unwrap() else {
            panic!("expected Added");
        };
        assert_eq!(replaced.len(), 2);
        assert_eq!(m.len(), 2);
        assert_eq!(m.get(Offset::new(0)).unwrap().committed_offset, Offset::new(1999));
    }

    #[test]
    fn test_compacted_add_rejects_partial_overlap() {
        let mut m = manifest();
        m.add(meta(0, 999, 100)).unwrap();
        m.add(meta(1000, 1999, 100)).unwrap();

        let mut merged = meta(500, 1999, 150);
        merged.is_compacted = true;
        assert!(m.add(merged).is_err());
    }

    #[test]
    fn test_find_containing() {
        let mut m = manifest();
        m.add(meta(100, 999, 10)).unwrap();
        m.add(meta(1000, 1999, 10)).unwrap();

        assert_eq!(
            m.find_containing(Offset::new(1500)).unwrap().base_offset,
            Offset::new(1000)
        );
        assert_eq!(
            m.find_containing(Offset::new(100)).unwrap().base_offset,
            Offset::new(100)
        );
        assert!(m.find_containing(Offset::new(50)).is_none());
        assert!(m.find_containing(Offset::new(2000)).is_none());
    }

    #[test]
    fn test_truncate_drops_whole_entries() {
        let mut m = manifest();
        m.add(meta(0, 999, 10)).unwrap();
        m.add(meta(1000, 1999, 10)).unwrap();
        m.add(meta(2000, 2999, 10)).unwrap();

        let dropped = m.truncate(Offset::new(2000));
        assert_eq!(dropped.len(), 2);
        assert_eq!(m.start_offset(), Offset::new(2000));
        assert_eq!(m.len(), 1);
        // Non-advancing truncate is a no-op.
        assert!(m.truncate(Offset::new(1000)).is_empty());
        assert_eq!(m.start_offset(), Offset::new(2000));
    }

    #[test]
    fn test_replace_run_with_merged_entry() {
        let mut m = manifest();
        m.add(meta(0, 999, 10)).unwrap();
        m.add(meta(1000, 1999, 10)).unwrap();
        m.add(meta(2000, 2999, 10)).unwrap();

        let mut merged = meta(1000, 2999, 18);
        merged.is_compacted = true;
        let removed = m
            .replace(merged, &[Offset::new(1000), Offset::new(2000)])
            .unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(m.len(), 2);
        assert_eq!(m.last_offset(), Some(Offset::new(2999)));
    }

    #[test]
    fn test_replace_rejects_mismatched_range() {
        let mut m = manifest();
        m.add(meta(0, 999, 10)).unwrap();
        m.add(meta(1000, 1999, 10)).unwrap();

        let mut merged = meta(0, 1500, 18);
        merged.is_compacted = true;
        assert!(m
            .replace(merged, &[Offset::new(0), Offset::new(1000)])
            .is_err());
    }

    #[test]
    fn test_insync_only_advances() {
        let mut m = manifest();
        m.advance_insync(10);
        m.advance_insync(5);
        assert_eq!(m.insync_offset(), 10);
    }

    #[test]
    fn test_json_roundtrip() {
        let mut m = manifest();
        m.add(meta(0, 999, 10)).unwrap();
        m.advance_insync(3);
        let json = m.to_json().unwrap();
        let back = PartitionManifest::from_json(&json).unwrap();
        assert_eq!(back, m);
    }
}
