//! Remote key scheme
//!
//! Keys are stable across replica movement: they embed the topic's
//! initial revision, never the current one. Every key is prefixed with
//! 8 lowercase hex digits of xxh32 over the rest of the key, evenly
//! distributing objects across the bucket keyspace.

use coldstream_common::{InitialRevision, Ntp, Offset, RemoteKey, Term};
use xxhash_rust::xxh32::xxh32;

/// Version tag embedded in segment names
const SEGMENT_NAME_VERSION: &str = "v1";

/// Serialization flavor of the partition manifest
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManifestFormat {
    Binary,
    Json,
}

impl ManifestFormat {
    #[must_use]
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Binary => "bin",
            Self::Json => "json",
        }
    }
}

/// Prepend the hash prefix to a key suffix.
#[must_use]
pub fn prefixed(suffix: &str) -> RemoteKey {
    RemoteKey::new(format!("{:08x}/{suffix}", xxh32(suffix.as_bytes(), 0)))
}

/// Directory part shared by all of a partition's segment keys, without the
/// hash prefix. Used to recognize this partition's objects in a bucket scan.
#[must_use]
pub fn partition_marker(ntp: &Ntp, revision: InitialRevision) -> String {
    format!(
        "{}/{}/{}_{}/",
        ntp.namespace, ntp.topic, ntp.partition, revision
    )
}

/// Key of a segment payload object.
#[must_use]
pub fn segment_path(
    ntp: &Ntp,
    revision: InitialRevision,
    base_offset: Offset,
    committed_offset: Offset,
    size_bytes: u64,
    segment_term: Term,
    archiver_term: Term,
) -> RemoteKey {
    let suffix = format!(
        "{}{}-{}-{}-{}-{}.log.{}",
        partition_marker(ntp, revision),
        base_offset,
        committed_offset,
        size_bytes,
        segment_term,
        SEGMENT_NAME_VERSION,
        archiver_term,
    );
    prefixed(&suffix)
}

/// Key of a segment's transaction metadata object.
#[must_use]
pub fn tx_path(segment: &RemoteKey) -> RemoteKey {
    RemoteKey::new(format!("{segment}.tx"))
}

/// Key of a segment's offset index object.
#[must_use]
pub fn index_path(segment: &RemoteKey) -> RemoteKey {
    RemoteKey::new(format!("{segment}.index"))
}

/// Key of the authoritative partition manifest.
#[must_use]
pub fn partition_manifest_path(
    ntp: &Ntp,
    revision: InitialRevision,
    format: ManifestFormat,
) -> RemoteKey {
    let suffix = format!(
        "meta/{}/{}/{}_{}/manifest.{}",
        ntp.namespace,
        ntp.topic,
        ntp.partition,
        revision,
        format.extension()
    );
    prefixed(&suffix)
}

/// Key of the topic manifest, shared by all partitions of the topic.
#[must_use]
pub fn topic_manifest_path(namespace: &str, topic: &str) -> RemoteKey {
    let suffix = format!("meta/{namespace}/{topic}/topic_manifest.json");
    prefixed(&suffix)
}

/// A segment key parsed back into its components
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedSegmentPath {
    pub base_offset: Offset,
    pub committed_offset: Offset,
    pub size_bytes: u64,
    pub segment_term: Term,
    pub archiver_term: Term,
}

/// Parse a segment payload key belonging to the given partition.
///
/// Returns `None` for keys of other partitions, manifest keys and the
/// `.tx`/`.index` companions of a segment.
#[must_use]
pub fn parse_segment_path(
    key: &RemoteKey,
    ntp: &Ntp,
    revision: InitialRevision,
) -> Option<ParsedSegmentPath> {
    let marker = partition_marker(ntp, revision);
    let (hash, suffix) = key.as_str().split_once('/')?;
    if hash.len() != 8 || !suffix.starts_with(&marker) {
        return None;
    }
    let name = &suffix[marker.len()..];
    // <base>-<committed>-<size>-<segterm>-v1.log.<archiver_term>
    let (stem, archiver_term) = name.split_once(".log.")?;
    if archiver_term.contains('.') {
        return None;
    }
    let mut parts = stem.split('-');
    let base = parts.next()?.parse().ok()?;
    let committed = parts.next()?.parse().ok()?;
    let size = parts.next()?.parse().ok()?;
    let segment_term = parts.next()?.parse().ok()?;
    if parts.next() != Some(SEGMENT_NAME_VERSION) || parts.next().is_some() {
        return None;
    }
    Some(ParsedSegmentPath {
        base_offset: Offset::new(base),
        committed_offset: Offset::new(committed),
        size_bytes: size,
        segment_term: Term::new(segment_term),
        archiver_term: Term::new(archiver_term.parse().ok()?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ntp() -> Ntp {
        Ntp::new("kafka", "events", 7)
    }

    #[test]
    fn test_segment_path_shape() {
        let key = segment_path(
            &ntp(),
            InitialRevision::new(21),
            Offset::new(1000),
            Offset::new(1999),
            4096,
            Term::new(3),
            Term::new(5),
        );
        let (hash, rest) = key.as_str().split_once('/').unwrap();
        assert_eq!(hash.len(), 8);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(rest, "kafka/events/7_21/1000-1999-4096-3-v1.log.5");
    }

    #[test]
    fn test_hash_prefix_is_deterministic() {
        let a = topic_manifest_path("kafka", "events");
        let b = topic_manifest_path("kafka", "events");
        assert_eq!(a, b);
    }

    #[test]
    fn test_manifest_paths() {
        let bin = partition_manifest_path(&ntp(), InitialRevision::new(21), ManifestFormat::Binary);
        assert!(bin.as_str().ends_with("meta/kafka/events/7_21/manifest.bin"));
        let json = partition_manifest_path(&ntp(), InitialRevision::new(21), ManifestFormat::Json);
        assert!(json.as_str().ends_with("meta/kafka/events/7_21/manifest.json"));
    }

    #[test]
    fn test_companion_paths() {
        let key = RemoteKey::new("ab/seg.log.4");
        assert_eq!(tx_path(&key).as_str(), "ab/seg.log.4.tx");
        assert_eq!(index_path(&key).as_str(), "ab/seg.log.4.index");
    }

    #[test]
    fn test_parse_segment_path_roundtrip() {
        let rev = InitialRevision::new(21);
        let key = segment_path(
            &ntp(),
            rev,
            Offset::new(500),
            Offset::new(999),
            1 << 20,
            Term::new(2),
            Term::new(9),
        );
        let parsed = parse_segment_path(&key, &ntp(), rev).unwrap();
        assert_eq!(parsed.base_offset, Offset::new(500));
        assert_eq!(parsed.committed_offset, Offset::new(999));
        assert_eq!(parsed.size_bytes, 1 << 20);
        assert_eq!(parsed.segment_term, Term::new(2));
        assert_eq!(parsed.archiver_term, Term::new(9));
    }

    #[test]
    fn test_parse_rejects_companions_and_other_partitions() {
        let rev = InitialRevision::new(21);
        let key = segment_path(
            &ntp(),
            rev,
            Offset::new(0),
            Offset::new(9),
            10,
            Term::new(1),
            Term::new(1),
        );
        assert!(parse_segment_path(&tx_path(&key), &ntp(), rev).is_none());
        assert!(parse_segment_path(&index_path(&key), &ntp(), rev).is_none());
        assert!(parse_segment_path(&key, &Ntp::new("kafka", "other", 7), rev).is_none());
        assert!(parse_segment_path(&key, &ntp(), InitialRevision::new(22)).is_none());
    }
}
