//! Entry codec
//!
//! The byte-level encoding of a single entry payload. Framing (length prefix
//! and checksum) is owned by the WAL; the codec only turns an entry into bytes
//! and back.

use std::fmt;

use crate::error::{KeepError, Result};

use super::WalEntry;

/// Encodes WAL entries to payload bytes and back
pub trait EntryCodec: Send + Sync + fmt::Debug {
    /// Short identifier used in logs
    fn name(&self) -> &'static str;

    fn encode(&self, entry: &WalEntry) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<WalEntry>;
}

/// Default codec: bincode over the serde derive of [`WalEntry`]
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl EntryCodec for BincodeCodec {
    fn name(&self) -> &'static str {
        "bincode"
    }

    fn encode(&self, entry: &WalEntry) -> Result<Vec<u8>> {
        bincode::serialize(entry).map_err(|e| KeepError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<WalEntry> {
        Ok(bincode::deserialize(bytes)?)
    }
}
