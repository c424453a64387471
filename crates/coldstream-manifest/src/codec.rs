//! Binary partition manifest codec
//!
//! Layout: magic, version, length-prefixed header, entry count,
//! length-prefixed entries, crc32c trailer over everything prior.
//! Length prefixes make the format forward compatible: a decoder reads
//! the fields it knows and skips unknown trailing bytes inside the
//! header and inside each entry.

use crate::partition::{PartitionManifest, SegmentMeta};
use bytes::Bytes;
use coldstream_common::{Error, InitialRevision, Ntp, Offset, Result, Term};

/// Magic number for binary manifests
const MANIFEST_MAGIC: u64 = 0x434F4C445F4D4654; // "COLD_MFT"

/// Binary manifest version
const MANIFEST_VERSION: u32 = 1;

/// Sentinel for an absent last offset
const NO_LAST_OFFSET: u64 = u64::MAX;

/// Serialize a manifest to its binary form.
#[must_use]
pub fn encode(manifest: &PartitionManifest) -> Bytes {
    let mut buf = Vec::with_capacity(64 + manifest.len() * 80);
    buf.extend_from_slice(&MANIFEST_MAGIC.to_le_bytes());
    buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());

    let header = encode_header(manifest);
    buf.extend_from_slice(&(header.len() as u32).to_le_bytes());
    buf.extend_from_slice(&header);

    buf.extend_from_slice(&(manifest.len() as u32).to_le_bytes());
    for meta in manifest.iter() {
        let entry = encode_entry(meta);
        buf.extend_from_slice(&(entry.len() as u32).to_le_bytes());
        buf.extend_from_slice(&entry);
    }

    let checksum = crc32c::crc32c(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    Bytes::from(buf)
}

fn encode_header(manifest: &PartitionManifest) -> Vec<u8> {
    let mut buf = Vec::new();
    put_str(&mut buf, &manifest.ntp().namespace);
    put_str(&mut buf, &manifest.ntp().topic);
    buf.extend_from_slice(&manifest.ntp().partition.to_le_bytes());
    buf.extend_from_slice(&manifest.revision().get().to_le_bytes());
    buf.extend_from_slice(&manifest.start_offset().get().to_le_bytes());
    let last = manifest
        .last_offset()
        .map_or(NO_LAST_OFFSET, |o| o.get());
    buf.extend_from_slice(&last.to_le_bytes());
    buf.extend_from_slice(&manifest.insync_offset().to_le_bytes());
    buf
}

/// Encode one segment meta in the length-prefixable entry form. Also used
/// by the archival command codec.
#[must_use]
pub fn encode_segment_meta(meta: &SegmentMeta) -> Vec<u8> {
    encode_entry(meta)
}

/// Decode one segment meta, ignoring unknown trailing bytes.
pub fn decode_segment_meta(payload: &[u8]) -> Result<SegmentMeta> {
    decode_entry(&mut Cursor::new(payload))
}

fn encode_entry(meta: &SegmentMeta) -> Vec<u8> {
    let mut buf = Vec::with_capacity(66);
    buf.extend_from_slice(&meta.base_offset.get().to_le_bytes());
    buf.extend_from_slice(&meta.committed_offset.get().to_le_bytes());
    buf.extend_from_slice(&meta.base_timestamp.to_le_bytes());
    buf.extend_from_slice(&meta.max_timestamp.to_le_bytes());
    buf.extend_from_slice(&meta.size_bytes.to_le_bytes());
    buf.extend_from_slice(&meta.delta_offset.to_le_bytes());
    buf.extend_from_slice(&meta.archiver_term.get().to_le_bytes());
    buf.extend_from_slice(&meta.segment_term.get().to_le_bytes());
    buf.push(u8::from(meta.is_compacted));
    buf.push(meta.sname_format);
    buf
}

/// Deserialize a manifest from its binary form, verifying the checksum.
pub fn decode(payload: &[u8]) -> Result<PartitionManifest> {
    if payload.len() < 4 {
        return Err(Error::ManifestCodec("truncated manifest".to_string()));
    }
    let (body, trailer) = payload.split_at(payload.len() - 4);
    let expected = u32::from_le_bytes(trailer.try_into().expect("4-byte trailer"));
    let actual = crc32c::crc32c(body);
    if actual != expected {
        return Err(Error::ManifestCodec(format!(
            "manifest checksum mismatch: expected {expected:08x}, got {actual:08x}"
        )));
    }

    let mut cursor = Cursor::new(body);
    let magic = cursor.get_u64()?;
    if magic != MANIFEST_MAGIC {
        return Err(Error::ManifestCodec("invalid manifest magic".to_string()));
    }
    let version = cursor.get_u32()?;
    if version > MANIFEST_VERSION {
        return Err(Error::ManifestCodec(format!(
            "unsupported manifest version: {version}"
        )));
    }

    let header_len = cursor.get_u32()? as usize;
    let mut header = Cursor::new(cursor.take(header_len)?);
    let namespace = header.get_str()?;
    let topic = header.get_str()?;
    let partition = header.get_u32()?;
    let revision = header.get_u64()?;
    let start_offset = header.get_u64()?;
    let last_offset = header.get_u64()?;
    let insync_offset = header.get_u64()?;
    // Unknown trailing header fields from newer writers are ignored.

    let entry_count = cursor.get_u32()? as usize;
    let mut entries = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        let entry_len = cursor.get_u32()? as usize;
        let mut entry = Cursor::new(cursor.take(entry_len)?);
        entries.push(decode_entry(&mut entry)?);
    }

    Ok(PartitionManifest::from_parts(
        Ntp::new(namespace, topic, partition),
        InitialRevision::new(revision),
        Offset::new(start_offset),
        (last_offset != NO_LAST_OFFSET).then(|| Offset::new(last_offset)),
        insync_offset,
        entries,
    ))
}

fn decode_entry(cursor: &mut Cursor<'_>) -> Result<SegmentMeta> {
    Ok(SegmentMeta {
        base_offset: Offset::new(cursor.get_u64()?),
        committed_offset: Offset::new(cursor.get_u64()?),
        base_timestamp: cursor.get_u64()?,
        max_timestamp: cursor.get_u64()?,
        size_bytes: cursor.get_u64()?,
        delta_offset: cursor.get_u64()?,
        archiver_term: Term::new(cursor.get_u64()?),
        segment_term: Term::new(cursor.get_u64()?),
        is_compacted: cursor.get_u8()? != 0,
        sname_format: cursor.get_u8()?,
        // Unknown trailing entry fields from newer writers are ignored.
    })
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

struct Cursor<'a> {
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.data.len() < len {
            return Err(Error::ManifestCodec("truncated manifest".to_string()));
        }
        let (taken, rest) = self.data.split_at(len);
        self.data = rest;
        Ok(taken)
    }

    fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn get_str(&mut self) -> Result<String> {
        let len = u16::from_le_bytes(self.take(2)?.try_into().expect("2 bytes")) as usize;
        String::from_utf8(self.take(len)?.to_vec())
            .map_err(|e| Error::ManifestCodec(format!("invalid string: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(base: u64, committed: u64) -> SegmentMeta {
        SegmentMeta {
            base_offset: Offset::new(base),
            committed_offset: Offset::new(committed),
            base_timestamp: 1_700_000_000_000,
            max_timestamp: 1_700_000_100_000,
            size_bytes: 4096,
            delta_offset: 2,
            archiver_term: Term::new(3),
            segment_term: Term::new(2),
            is_compacted: false,
            sname_format: 1,
        }
    }

    fn manifest() -> PartitionManifest {
        let mut m =
            PartitionManifest::new(Ntp::new("kafka", "events", 3), InitialRevision::new(11));
        m.add(meta(0, 999)).unwrap();
        m.add(meta(1000, 1999)).unwrap();
        m.advance_insync(7);
        m
    }

    #[test]
    fn test_roundtrip_identity() {
        let m = manifest();
        let encoded = encode(&m);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, m);
    }

    #[test]
    fn test_empty_manifest_roundtrip() {
        let m = PartitionManifest::new(Ntp::new("ns", "t", 0), InitialRevision::new(1));
        let decoded = decode(&encode(&m)).unwrap();
        assert_eq!(decoded, m);
        assert_eq!(decoded.last_offset(), None);
    }

    #[test]
    fn test_checksum_mismatch_rejected() {
        let mut encoded = encode(&manifest()).to_vec();
        let mid = encoded.len() / 2;
        encoded[mid] ^= 0xFF;
        assert!(matches!(
            decode(&encoded),
            Err(Error::ManifestCodec(msg)) if msg.contains("checksum")
        ));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let encoded = encode(&manifest());
        assert!(decode(&encoded[..encoded.len() - 8]).is_err());
        assert!(decode(&[]).is_err());
    }

    /// A newer writer may append fields to the header and to each entry;
    /// this decoder must skip them.
    #[test]
    fn test_unknown_trailing_fields_are_skipped() {
        let m = manifest();
        let mut buf = Vec::new();
        buf.extend_from_slice(&MANIFEST_MAGIC.to_le_bytes());
        buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());

        let mut header = encode_header(&m);
        header.extend_from_slice(&123u64.to_le_bytes()); // future header field
        buf.extend_from_slice(&(header.len() as u32).to_le_bytes());
        buf.extend_from_slice(&header);

        buf.extend_from_slice(&(m.len() as u32).to_le_bytes());
        for meta in m.iter() {
            let mut entry = encode_entry(meta);
            entry.extend_from_slice(b"future"); // future entry field
            buf.extend_from_slice(&(entry.len() as u32).to_le_bytes());
            buf.extend_from_slice(&entry);
        }
        buf.extend_from_slice(&crc32c::crc32c(&buf).to_le_bytes());

        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded, m);
    }
}
