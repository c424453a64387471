//! Archival metadata commands
//!
//! The tagged union appended to the partition's replicated log. Records
//! are individually length-prefixed and checksummed so a batch can be
//! decoded record by record, and newer writers can append fields to a
//! record body without breaking older readers.

use coldstream_manifest::codec::{decode_segment_meta, encode_segment_meta};
use coldstream_manifest::SegmentMeta;
use coldstream_common::{Error, Offset, Result};
use serde::{Deserialize, Serialize};

const TAG_ADD_SEGMENT: u8 = 1;
const TAG_TRUNCATE: u8 = 2;
const TAG_MARK_CLEAN: u8 = 3;
const TAG_REPLACE_SEGMENTS: u8 = 4;
const TAG_UPDATE_START_KAFKA_OFFSET: u8 = 5;

/// Command replicated through the partition's consensus layer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchivalCommand {
    /// Make an uploaded segment visible in the manifest.
    AddSegment(SegmentMeta),
    /// Advance the retention lower bound.
    Truncate { new_start_offset: Offset },
    /// Record that the remote manifest reflects the view up to this offset.
    MarkClean { insync_offset: u64 },
    /// Replace a contiguous run of entries with one merged entry.
    ReplaceSegments {
        merged: SegmentMeta,
        replaced: Vec<Offset>,
    },
    /// Advance the client-visible start offset.
    UpdateStartKafkaOffset { offset: Offset },
}

impl ArchivalCommand {
    fn tag(&self) -> u8 {
        match self {
            Self::AddSegment(_) => TAG_ADD_SEGMENT,
            Self::Truncate { .. } => TAG_TRUNCATE,
            Self::MarkClean { .. } => TAG_MARK_CLEAN,
            Self::ReplaceSegments { .. } => TAG_REPLACE_SEGMENTS,
            Self::UpdateStartKafkaOffset { .. } => TAG_UPDATE_START_KAFKA_OFFSET,
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        match self {
            Self::AddSegment(meta) => encode_segment_meta(meta),
            Self::Truncate { new_start_offset } => new_start_offset.get().to_le_bytes().to_vec(),
            Self::MarkClean { insync_offset } => insync_offset.to_le_bytes().to_vec(),
            Self::ReplaceSegments { merged, replaced } => {
                let meta = encode_segment_meta(merged);
                let mut buf = Vec::with_capacity(8 + meta.len() + replaced.len() * 8);
                buf.extend_from_slice(&(meta.len() as u32).to_le_bytes());
                buf.extend_from_slice(&meta);
                buf.extend_from_slice(&(replaced.len() as u32).to_le_bytes());
                for base in replaced {
                    buf.extend_from_slice(&base.get().to_le_bytes());
                }
                buf
            }
            Self::UpdateStartKafkaOffset { offset } => offset.get().to_le_bytes().to_vec(),
        }
    }

    fn decode_body(tag: u8, body: &[u8]) -> Result<Self> {
        let get_u64 = |buf: &[u8], at: usize| -> Result<u64> {
            buf.get(at..at + 8)
                .map(|b| u64::from_le_bytes(b.try_into().expect("8 bytes")))
                .ok_or_else(|| Error::CommandCodec("truncated command body".to_string()))
        };
        match tag {
            TAG_ADD_SEGMENT => Ok(Self::AddSegment(
                decode_segment_meta(body).map_err(|e| Error::CommandCodec(e.to_string()))?,
            )),
            TAG_TRUNCATE => Ok(Self::Truncate {
                new_start_offset: Offset::new(get_u64(body, 0)?),
            }),
            TAG_MARK_CLEAN => Ok(Self::MarkClean {
                insync_offset: get_u64(body, 0)?,
            }),
            TAG_REPLACE_SEGMENTS => {
                let meta_len = body
                    .get(..4)
                    .map(|b| u32::from_le_bytes(b.try_into().expect("4 bytes")) as usize)
                    .ok_or_else(|| Error::CommandCodec("truncated command body".to_string()))?;
                let meta_end = 4 + meta_len;
                let meta = body
                    .get(4..meta_end)
                    .ok_or_else(|| Error::CommandCodec("truncated command body".to_string()))?;
                let merged =
                    decode_segment_meta(meta).map_err(|e| Error::CommandCodec(e.to_string()))?;
                let count = body
                    .get(meta_end..meta_end + 4)
                    .map(|b| u32::from_le_bytes(b.try_into().expect("4 bytes")) as usize)
                    .ok_or_else(|| Error::CommandCodec("truncated command body".to_string()))?;
                let mut replaced = Vec::with_capacity(count);
                for i in 0..count {
                    replaced.push(Offset::new(get_u64(body, meta_end + 4 + i * 8)?));
                }
                Ok(Self::ReplaceSegments { merged, replaced })
            }
            TAG_UPDATE_START_KAFKA_OFFSET => Ok(Self::UpdateStartKafkaOffset {
                offset: Offset::new(get_u64(body, 0)?),
            }),
            other => Err(Error::CommandCodec(format!("unknown command tag: {other}"))),
        }
    }
}

/// Encode a batch of commands into the replicated wire form.
#[must_use]
pub fn encode_batch(commands: &[ArchivalCommand]) -> Vec<u8> {
    let mut buf = Vec::new();
    for command in commands {
        let body = command.encode_body();
        let start = buf.len();
        buf.push(command.tag());
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&body);
        let checksum = crc32c::crc32c(&buf[start..]);
        buf.extend_from_slice(&checksum.to_le_bytes());
    }
    buf
}

/// Decode a batch previously produced by `encode_batch`.
pub fn decode_batch(mut payload: &[u8]) -> Result<Vec<ArchivalCommand>> {
    let mut commands = Vec::new();
    while !payload.is_empty() {
        if payload.len() < 5 {
            return Err(Error::CommandCodec("truncated command record".to_string()));
        }
        let tag = payload[0];
        let body_len =
            u32::from_le_bytes(payload[1..5].try_into().expect("4 bytes")) as usize;
        let record_len = 5 + body_len;
        if payload.len() < record_len + 4 {
            return Err(Error::CommandCodec("truncated command record".to_string()));
        }
        let expected = u32::from_le_bytes(
            payload[record_len..record_len + 4]
                .try_into()
                .expect("4 bytes"),
        );
        let actual = crc32c::crc32c(&payload[..record_len]);
        if actual != expected {
            return Err(Error::CommandCodec(format!(
                "command checksum mismatch: expected {expected:08x}, got {actual:08x}"
            )));
        }
        commands.push(ArchivalCommand::decode_body(tag, &payload[5..record_len])?);
        payload = &payload[record_len + 4..];
    }
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use coldstream_common::Term;

    fn meta(base: u64, committed: u64) -> SegmentMeta {
        SegmentMeta {
            base_offset: Offset::new(base),
            committed_offset: Offset::new(committed),
            base_timestamp: 1_700_000_000_000,
            max_timestamp: 1_700_000_100_000,
            size_bytes: 1024,
            delta_offset: 0,
            archiver_term: Term::new(2),
            segment_term: Term::new(1),
            is_compacted: false,
            sname_format: 1,
        }
    }

    #[test]
    fn test_batch_roundtrip() {
        let commands = vec![
            ArchivalCommand::AddSegment(meta(0, 999)),
            ArchivalCommand::Truncate {
                new_start_offset: Offset::new(1000),
            },
            ArchivalCommand::MarkClean { insync_offset: 17 },
            ArchivalCommand::ReplaceSegments {
                merged: meta(1000, 2999),
                replaced: vec![Offset::new(1000), Offset::new(2000)],
            },
            ArchivalCommand::UpdateStartKafkaOffset {
                offset: Offset::new(1200),
            },
        ];
        let encoded = encode_batch(&commands);
        let decoded = decode_batch(&encoded).unwrap();
        assert_eq!(decoded, commands);
    }

    #[test]
    fn test_empty_batch() {
        assert!(decode_batch(&encode_batch(&[])).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_record_rejected() {
        let mut encoded = encode_batch(&[ArchivalCommand::MarkClean { insync_offset: 1 }]);
        let last = encoded.len() - 6;
        encoded[last] ^= 0xFF;
        assert!(decode_batch(&encoded).is_err());
    }

    #[test]
    fn test_truncated_record_rejected() {
        let encoded = encode_batch(&[ArchivalCommand::Truncate {
            new_start_offset: Offset::new(5),
        }]);
        assert!(decode_batch(&encoded[..encoded.len() - 2]).is_err());
    }
}
