//! Journal frame format.
//!
//! Every commit is written as exactly one frame:
//!
//! ```text
//! | magic "FDBJ" (4) | version u16 | payload_len u32 | payload | checksum (8) |
//! ```
//!
//! The checksum is the first eight bytes of SHA-256 over header and payload.
//! The payload is `sequence u64 | timestamp i64 | op_count u32` followed by
//! the ops, each `tag u8 | kind u32 | key u64 | version u64`, and for puts
//! `row_len u32 | row` where `row` is the CBOR encoding of the row values.
//! Kind names append `name_len u32 | name` in UTF-8. Integers are
//! little-endian.

use crate::error::{CoreError, CoreResult};
use crate::row::RowValues;
use crate::types::{KindId, SequenceNumber, VersionToken};
use faultdb_codec::{from_cbor, to_cbor};
use sha2::{Digest, Sha256};

/// Magic bytes identifying a journal frame.
pub const FRAME_MAGIC: [u8; 4] = *b"FDBJ";

/// Current frame format version.
pub const FRAME_VERSION: u16 = 1;

/// Bytes before the payload.
pub const HEADER_LEN: usize = 10;

/// Bytes after the payload.
pub const CHECKSUM_LEN: usize = 8;

const TAG_PUT: u8 = 1;
const TAG_DELETE: u8 = 2;
const TAG_SCHEMA: u8 = 3;
const TAG_KEY_FLOOR: u8 = 4;
const TAG_KIND_NAME: u8 = 5;

/// One operation inside a commit frame.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalOp {
    /// Insert or replace a row.
    Put {
        /// Entity kind.
        kind: KindId,
        /// Primary key.
        key: u64,
        /// Version the row is written at.
        version: VersionToken,
        /// Row values.
        values: RowValues,
    },
    /// Remove a row.
    Delete {
        /// Entity kind.
        kind: KindId,
        /// Primary key.
        key: u64,
    },
    /// Record the schema version the following rows conform to.
    SchemaVersion(u32),
    /// Keep primary keys of `kind` at or above `next`, even with no live row.
    KeyFloor {
        /// Entity kind.
        kind: KindId,
        /// Lowest key that may still be assigned.
        next: u64,
    },
    /// Record the entity name a kind is registered under.
    KindName {
        /// Entity kind.
        kind: KindId,
        /// Entity name.
        name: String,
    },
}

/// The content of one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitFrame {
    /// Commit sequence number.
    pub sequence: SequenceNumber,
    /// Commit time in milliseconds since the epoch.
    pub timestamp: i64,
    /// Operations, applied in order.
    pub ops: Vec<JournalOp>,
}

/// Position of an encoded row relative to the start of its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowSpan {
    /// Offset from the frame start.
    pub offset: u64,
    /// Encoded length.
    pub len: usize,
}

/// An encoded frame with the spans of its put rows, parallel to `ops`.
#[derive(Debug)]
pub struct EncodedFrame {
    /// Frame bytes.
    pub bytes: Vec<u8>,
    /// Row span for each put op, `None` for other ops.
    pub spans: Vec<Option<RowSpan>>,
}

/// Result of reading one frame from a byte slice.
#[derive(Debug)]
pub enum FrameRead {
    /// A complete, verified frame.
    Frame {
        /// The decoded content.
        frame: CommitFrame,
        /// Row spans, parallel to `frame.ops`.
        spans: Vec<Option<RowSpan>>,
        /// Total bytes consumed.
        len: usize,
    },
    /// The slice ends inside a frame.
    Torn,
}

fn checksum(data: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest[..CHECKSUM_LEN]);
    out
}

impl CommitFrame {
    /// Encodes the frame.
    ///
    /// # Errors
    ///
    /// Returns an error if a row cannot be encoded or the frame exceeds 4 GiB.
    pub fn encode(&self) -> CoreResult<EncodedFrame> {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&FRAME_MAGIC);
        buf.extend_from_slice(&FRAME_VERSION.to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]); // payload length, patched below

        buf.extend_from_slice(&self.sequence.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        let count = u32::try_from(self.ops.len())
            .map_err(|_| CoreError::invalid_operation("too many operations in one commit"))?;
        buf.extend_from_slice(&count.to_le_bytes());

        let mut spans = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            match op {
                JournalOp::Put {
                    kind,
                    key,
                    version,
                    values,
                } => {
                    put_head(&mut buf, TAG_PUT, *kind, *key, version.0);
                    let row = to_cbor(values)?;
                    let len = u32::try_from(row.len())
                        .map_err(|_| CoreError::invalid_operation("row too large"))?;
                    buf.extend_from_slice(&len.to_le_bytes());
                    spans.push(Some(RowSpan {
                        offset: buf.len() as u64,
                        len: row.len(),
                    }));
                    buf.extend_from_slice(&row);
                }
                JournalOp::Delete { kind, key } => {
                    put_head(&mut buf, TAG_DELETE, *kind, *key, 0);
                    spans.push(None);
                }
                JournalOp::SchemaVersion(version) => {
                    put_head(&mut buf, TAG_SCHEMA, KindId(0), u64::from(*version), 0);
                    spans.push(None);
                }
                JournalOp::KeyFloor { kind, next } => {
                    put_head(&mut buf, TAG_KEY_FLOOR, *kind, *next, 0);
                    spans.push(None);
                }
                JournalOp::KindName { kind, name } => {
                    put_head(&mut buf, TAG_KIND_NAME, *kind, 0, 0);
                    let len = u32::try_from(name.len())
                        .map_err(|_| CoreError::invalid_operation("entity name too long"))?;
                    buf.extend_from_slice(&len.to_le_bytes());
                    buf.extend_from_slice(name.as_bytes());
                    spans.push(None);
                }
            }
        }

        let payload_len = u32::try_from(buf.len() - HEADER_LEN)
            .map_err(|_| CoreError::invalid_operation("commit frame too large"))?;
        buf[6..10].copy_from_slice(&payload_len.to_le_bytes());
        let sum = checksum(&buf);
        buf.extend_from_slice(&sum);

        Ok(EncodedFrame { bytes: buf, spans })
    }
}

fn put_head(buf: &mut Vec<u8>, tag: u8, kind: KindId, key: u64, version: u64) {
    buf.push(tag);
    buf.extend_from_slice(&kind.0.to_le_bytes());
    buf.extend_from_slice(&key.to_le_bytes());
    buf.extend_from_slice(&version.to_le_bytes());
}

/// Reads the frame at the start of `data`.
///
/// # Errors
///
/// Returns `StoreCorruption` for a bad magic, unknown version, checksum
/// mismatch or malformed payload in a complete frame.
pub fn read_frame(data: &[u8]) -> CoreResult<FrameRead> {
    if data.len() < HEADER_LEN {
        return Ok(FrameRead::Torn);
    }
    if data[0..4] != FRAME_MAGIC {
        return Err(CoreError::store_corruption("invalid frame magic"));
    }
    let version = u16::from_le_bytes([data[4], data[5]]);
    if version != FRAME_VERSION {
        return Err(CoreError::store_corruption(format!(
            "unsupported frame version {version}"
        )));
    }
    let payload_len = u32::from_le_bytes([data[6], data[7], data[8], data[9]]) as usize;
    let body_end = HEADER_LEN + payload_len;
    let total = body_end + CHECKSUM_LEN;
    if data.len() < total {
        return Ok(FrameRead::Torn);
    }
    if checksum(&data[..body_end]) != data[body_end..total] {
        return Err(CoreError::store_corruption("frame checksum mismatch"));
    }

    let mut reader = Reader {
        data: &data[..body_end],
        pos: HEADER_LEN,
    };
    let sequence = SequenceNumber(reader.u64()?);
    let timestamp = reader.u64()? as i64;
    let count = reader.u32()? as usize;

    let mut ops = Vec::with_capacity(count);
    let mut spans = Vec::with_capacity(count);
    for _ in 0..count {
        let tag = reader.u8()?;
        let kind = KindId(reader.u32()?);
        let key = reader.u64()?;
        let version = VersionToken(reader.u64()?);
        match tag {
            TAG_PUT => {
                let len = reader.u32()? as usize;
                let offset = reader.pos as u64;
                let values: RowValues = from_cbor(reader.bytes(len)?)?;
                spans.push(Some(RowSpan { offset, len }));
                ops.push(JournalOp::Put {
                    kind,
                    key,
                    version,
                    values,
                });
            }
            TAG_DELETE => {
                spans.push(None);
                ops.push(JournalOp::Delete { kind, key });
            }
            TAG_SCHEMA => {
                let version = u32::try_from(key)
                    .map_err(|_| CoreError::store_corruption("schema version out of range"))?;
                spans.push(None);
                ops.push(JournalOp::SchemaVersion(version));
            }
            TAG_KEY_FLOOR => {
                spans.push(None);
                ops.push(JournalOp::KeyFloor { kind, next: key });
            }
            TAG_KIND_NAME => {
                let len = reader.u32()? as usize;
                let name = std::str::from_utf8(reader.bytes(len)?)
                    .map_err(|_| CoreError::store_corruption("kind name is not UTF-8"))?;
                spans.push(None);
                ops.push(JournalOp::KindName {
                    kind,
                    name: name.to_string(),
                });
            }
            other => {
                return Err(CoreError::store_corruption(format!(
                    "unknown op tag {other}"
                )))
            }
        }
    }
    if reader.pos != body_end {
        return Err(CoreError::store_corruption("trailing bytes in frame payload"));
    }

    Ok(FrameRead::Frame {
        frame: CommitFrame {
            sequence,
            timestamp,
            ops,
        },
        spans,
        len: total,
    })
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| CoreError::store_corruption("frame payload too short"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let b = self.bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultdb_codec::Value;

    fn sample() -> CommitFrame {
        let mut values = RowValues::new();
        values.insert("code".into(), Value::Integer(250));
        values.insert("name".into(), Value::from("France"));
        CommitFrame {
            sequence: SequenceNumber(7),
            timestamp: 1_700_000_000_000,
            ops: vec![
                JournalOp::SchemaVersion(2),
                JournalOp::Put {
                    kind: KindId(1),
                    key: 1,
                    version: VersionToken(1),
                    values,
                },
                JournalOp::Delete {
                    kind: KindId(1),
                    key: 9,
                },
                JournalOp::KeyFloor {
                    kind: KindId(1),
                    next: 10,
                },
                JournalOp::KindName {
                    kind: KindId(1),
                    name: "Country".into(),
                },
            ],
        }
    }

    #[test]
    fn encode_then_read() {
        let encoded = sample().encode().unwrap();
        match read_frame(&encoded.bytes).unwrap() {
            FrameRead::Frame { frame, spans, len } => {
                assert_eq!(frame, sample());
                assert_eq!(len, encoded.bytes.len());
                assert_eq!(spans, encoded.spans);
            }
            FrameRead::Torn => panic!("complete frame read as torn"),
        }
    }

    #[test]
    fn row_span_points_at_row_bytes() {
        let encoded = sample().encode().unwrap();
        let span = encoded.spans[1].unwrap();
        let start = span.offset as usize;
        let values: RowValues = from_cbor(&encoded.bytes[start..start + span.len]).unwrap();
        assert_eq!(values.get("name"), Some(&Value::from("France")));
    }

    #[test]
    fn every_prefix_is_torn() {
        let bytes = sample().encode().unwrap().bytes;
        for cut in [0, 3, HEADER_LEN, bytes.len() / 2, bytes.len() - 1] {
            assert!(matches!(read_frame(&bytes[..cut]).unwrap(), FrameRead::Torn));
        }
    }

    #[test]
    fn flipped_bit_is_corruption() {
        let mut bytes = sample().encode().unwrap().bytes;
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0x40;
        assert!(matches!(
            read_frame(&bytes),
            Err(CoreError::StoreCorruption { .. })
        ));
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut bytes = sample().encode().unwrap().bytes;
        bytes[0] = b'X';
        assert!(read_frame(&bytes).is_err());
    }
}
