//! WAL Entry definitions
//!
//! Defines the structure of individual WAL log entries and their on-disk frame.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{KeepError, Result};

use super::codec::{BincodeCodec, EntryCodec};

/// Frame header size: Sequence (8) + CRC (4) + Len (4) = 16 bytes
pub const HEADER_SIZE: usize = 16;

/// Payload bytes allowed on top of key and value
///
/// Covers the encoded sequence, timestamp, variant tag, length prefixes and
/// expiry. The bincode encoding needs 45 of these.
pub const PAYLOAD_OVERHEAD: u32 = 64;

/// Largest frame payload for entries whose key plus value fit `max_entry_size`
pub fn payload_limit(max_entry_size: u32) -> u32 {
    max_entry_size.saturating_add(PAYLOAD_OVERHEAD)
}

/// A single entry in the WAL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Sequence number - strictly increasing across all segments
    pub sequence: u64,

    /// Timestamp (unix millis) when entry was created
    pub timestamp: i64,

    /// The operation to perform
    pub operation: Operation,
}

/// Operations that can be logged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Put a key-value pair, optionally expiring at an absolute unix-millis time
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        expires_at: Option<i64>,
    },

    /// Delete a key
    Delete { key: Vec<u8> },

    /// Remove every key
    Clear,
}

/// Discriminant of an [`Operation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Put,
    Delete,
    Clear,
}

impl Operation {
    /// Put without expiry
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Operation::Put {
            key: key.into(),
            value: value.into(),
            expires_at: None,
        }
    }

    pub fn put_expiring(
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        expires_at: i64,
    ) -> Self {
        Operation::Put {
            key: key.into(),
            value: value.into(),
            expires_at: Some(expires_at),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Operation::Delete { key: key.into() }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Put { .. } => OpKind::Put,
            Operation::Delete { .. } => OpKind::Delete,
            Operation::Clear => OpKind::Clear,
        }
    }

    /// The key this operation touches, if any
    pub fn key(&self) -> Option<&[u8]> {
        match self {
            Operation::Put { key, .. } | Operation::Delete { key } => Some(key),
            Operation::Clear => None,
        }
    }

    /// The value written by this operation, if any
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Operation::Put { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Key plus value length, the quantity bounded by `max_entry_size_bytes`
    pub fn data_len(&self) -> usize {
        self.key().map_or(0, <[u8]>::len) + self.value().map_or(0, <[u8]>::len)
    }
}

impl WalEntry {
    /// Create an entry stamped with the current time
    pub fn new(sequence: u64, operation: Operation) -> Self {
        Self {
            sequence,
            timestamp: now_millis(),
            operation,
        }
    }

    /// Serialize into a complete frame using the default codec
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(encode_frame(self, &BincodeCodec)?.to_vec())
    }

    /// Deserialize one complete frame produced by [`WalEntry::serialize`]
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let (entry, _) = decode_frame(bytes, &BincodeCodec, u32::MAX)?;
        Ok(entry)
    }
}

/// Current wall-clock time in unix milliseconds
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// =============================================================================
// Framing
// =============================================================================

/// Parsed fixed-size frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub sequence: u64,
    pub checksum: u32,
    pub payload_len: u32,
}

impl FrameHeader {
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut seq = [0u8; 8];
        let mut crc = [0u8; 4];
        let mut len = [0u8; 4];
        seq.copy_from_slice(&bytes[0..8]);
        crc.copy_from_slice(&bytes[8..12]);
        len.copy_from_slice(&bytes[12..16]);

        Self {
            sequence: u64::from_le_bytes(seq),
            checksum: u32::from_le_bytes(crc),
            payload_len: u32::from_le_bytes(len),
        }
    }

    /// Total frame size on disk
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_len as usize
    }
}

/// CRC32 over sequence ‖ length ‖ payload
///
/// Covering the header fields means a flipped bit in the length or sequence
/// is caught just like one in the payload.
pub fn frame_checksum(sequence: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&sequence.to_le_bytes());
    hasher.update(&(payload.len() as u32).to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Encode an entry as `[sequence u64][crc u32][len u32][payload]`
pub fn encode_frame(entry: &WalEntry, codec: &dyn EntryCodec) -> Result<BytesMut> {
    let payload = codec.encode(entry)?;
    if payload.len() > u32::MAX as usize {
        return Err(KeepError::WalWrite(format!(
            "entry payload of {} bytes does not fit a frame",
            payload.len()
        )));
    }

    let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    frame.put_u64_le(entry.sequence);
    frame.put_u32_le(frame_checksum(entry.sequence, &payload));
    frame.put_u32_le(payload.len() as u32);
    frame.put_slice(&payload);
    Ok(frame)
}

/// Decode one frame from the front of `bytes`
///
/// Returns the entry and the number of bytes consumed. Any truncation,
/// checksum mismatch, oversized length or header/payload disagreement is
/// reported as `WalCorruption`.
pub fn decode_frame(
    bytes: &[u8],
    codec: &dyn EntryCodec,
    max_payload: u32,
) -> Result<(WalEntry, usize)> {
    if bytes.len() < HEADER_SIZE {
        return Err(KeepError::WalCorruption(format!(
            "truncated header: {} of {} bytes",
            bytes.len(),
            HEADER_SIZE
        )));
    }

    let mut raw = [0u8; HEADER_SIZE];
    raw.copy_from_slice(&bytes[..HEADER_SIZE]);
    let header = FrameHeader::parse(&raw);

    if header.payload_len > max_payload {
        return Err(KeepError::WalCorruption(format!(
            "frame length {} exceeds limit {}",
            header.payload_len, max_payload
        )));
    }
    if bytes.len() < header.frame_len() {
        return Err(KeepError::WalCorruption(format!(
            "truncated payload: {} of {} bytes",
            bytes.len() - HEADER_SIZE,
            header.payload_len
        )));
    }

    let payload = &bytes[HEADER_SIZE..header.frame_len()];
    let entry = decode_payload(&header, payload, codec)?;
    Ok((entry, header.frame_len()))
}

/// Verify and decode a payload whose header has already been read
pub(crate) fn decode_payload(
    header: &FrameHeader,
    payload: &[u8],
    codec: &dyn EntryCodec,
) -> Result<WalEntry> {
    let actual = frame_checksum(header.sequence, payload);
    if actual != header.checksum {
        return Err(KeepError::WalCorruption(format!(
            "checksum mismatch at sequence {}: expected {:#010x}, got {:#010x}",
            header.sequence, header.checksum, actual
        )));
    }

    let entry = codec
        .decode(payload)
        .map_err(|e| KeepError::WalCorruption(format!("undecodable payload: {}", e)))?;

    if entry.sequence != header.sequence {
        return Err(KeepError::WalCorruption(format!(
            "header sequence {} disagrees with payload sequence {}",
            header.sequence, entry.sequence
        )));
    }

    Ok(entry)
}
