//! Snapshot Reader
//!
//! Verifies and loads snapshot files.
//!
//! Nothing is handed to the caller before the trailer checksum matches: a
//! load first hashes the whole file, then decodes the payload in a second
//! pass. Any mismatch (magic, version, checksum, record count, trailing
//! bytes) is reported as `SnapshotCorruption`.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crc32fast::Hasher;

use crate::cache::CacheRecord;
use crate::error::{KeepError, Result};

use super::{SnapshotMeta, FLAG_ZSTD, HEADER_SIZE, MAGIC, TRAILER_MAGIC, TRAILER_SIZE, VERSION};

const READ_BUFFER_CAPACITY: usize = 256 * 1024;

/// Parsed header and trailer of a snapshot file
#[derive(Debug, Clone, Copy)]
struct Framing {
    flags: u8,
    timestamp: i64,
    entry_count: u64,
    watermark: u64,
    checksum: u32,
    file_len: u64,
}

impl Framing {
    fn compressed(&self) -> bool {
        self.flags & FLAG_ZSTD != 0
    }

    fn payload_len(&self) -> u64 {
        self.file_len - HEADER_SIZE - TRAILER_SIZE
    }

    fn into_meta(self, path: &Path) -> SnapshotMeta {
        SnapshotMeta {
            path: path.to_path_buf(),
            timestamp: self.timestamp,
            watermark: self.watermark,
            entry_count: self.entry_count,
            checksum: self.checksum,
            compressed: self.compressed(),
            size_bytes: self.file_len,
        }
    }
}

/// Reads snapshot files
pub struct SnapshotReader;

impl SnapshotReader {
    /// Read header and trailer only; the checksum is not verified
    pub fn read_meta(path: &Path) -> Result<SnapshotMeta> {
        let mut file = File::open(path)?;
        Ok(read_framing(&mut file)?.into_meta(path))
    }

    /// Verify checksum and decode every record without keeping them
    pub fn verify(path: &Path) -> Result<SnapshotMeta> {
        Self::load(path, |_| {})
    }

    /// Verify the snapshot, then feed every record to `sink`
    ///
    /// `sink` is only called once the checksum has matched. If decoding
    /// fails afterwards some records may already have been delivered; the
    /// caller is expected to discard them.
    pub fn load<F>(path: &Path, mut sink: F) -> Result<SnapshotMeta>
    where
        F: FnMut(CacheRecord),
    {
        let mut file = File::open(path)?;
        let framing = read_framing(&mut file)?;

        // Pass 1: checksum over everything before the CRC field
        file.seek(SeekFrom::Start(0))?;
        let actual = checksum_prefix(&mut file, framing.file_len - 8)?;
        if actual != framing.checksum {
            return Err(KeepError::SnapshotCorruption(format!(
                "checksum mismatch: expected {:08x}, got {:08x}",
                framing.checksum, actual
            )));
        }

        // Pass 2: decode records
        file.seek(SeekFrom::Start(HEADER_SIZE))?;
        let payload = BufReader::with_capacity(READ_BUFFER_CAPACITY, file).take(framing.payload_len());

        let count = if framing.compressed() {
            let mut decoder = zstd::stream::read::Decoder::new(payload)
                .map_err(|e| KeepError::SnapshotCorruption(format!("zstd: {}", e)))?;
            let count = read_records(&mut decoder, framing.entry_count, &mut sink)?;
            expect_end(&mut decoder)?;
            count
        } else {
            let mut payload = payload;
            let count = read_records(&mut payload, framing.entry_count, &mut sink)?;
            expect_end(&mut payload)?;
            count
        };

        tracing::debug!(
            path = %path.display(),
            entries = count,
            watermark = framing.watermark,
            "Snapshot verified"
        );
        Ok(framing.into_meta(path))
    }
}

fn read_framing(file: &mut File) -> Result<Framing> {
    let file_len = file.metadata()?.len();
    if file_len < HEADER_SIZE + TRAILER_SIZE {
        return Err(KeepError::SnapshotCorruption(format!(
            "file too short: {} bytes",
            file_len
        )));
    }

    // Header
    let mut header = [0u8; HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header)?;
    if &header[0..4] != MAGIC {
        return Err(KeepError::SnapshotCorruption("invalid header magic".into()));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        return Err(KeepError::SnapshotCorruption(format!(
            "unsupported snapshot version {}",
            version
        )));
    }
    let flags = header[6];

    // Trailer
    let mut trailer = [0u8; TRAILER_SIZE as usize];
    file.seek(SeekFrom::Start(file_len - TRAILER_SIZE))?;
    file.read_exact(&mut trailer)?;
    if &trailer[28..32] != TRAILER_MAGIC {
        return Err(KeepError::SnapshotCorruption("invalid trailer magic".into()));
    }

    Ok(Framing {
        flags,
        timestamp: i64::from_le_bytes(array8(&trailer[0..8])),
        entry_count: u64::from_le_bytes(array8(&trailer[8..16])),
        watermark: u64::from_le_bytes(array8(&trailer[16..24])),
        checksum: u32::from_le_bytes([trailer[24], trailer[25], trailer[26], trailer[27]]),
        file_len,
    })
}

fn array8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(bytes);
    out
}

fn checksum_prefix(file: &mut File, len: u64) -> Result<u32> {
    let mut hasher = Hasher::new();
    let mut reader = BufReader::with_capacity(READ_BUFFER_CAPACITY, file).take(len);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

fn read_records<R, F>(input: &mut R, expected: u64, sink: &mut F) -> Result<u64>
where
    R: Read,
    F: FnMut(CacheRecord),
{
    for _ in 0..expected {
        sink(read_record(input)?);
    }
    Ok(expected)
}

fn read_record<R: Read>(input: &mut R) -> Result<CacheRecord> {
    let key_len = read_u32(input)? as usize;
    let key = read_bytes(input, key_len)?;
    let value_len = read_u32(input)? as usize;
    let value = read_bytes(input, value_len)?;

    let mut flag = [0u8; 1];
    read_exact(input, &mut flag)?;
    let expires_at = match flag[0] {
        0 => None,
        1 => {
            let mut raw = [0u8; 8];
            read_exact(input, &mut raw)?;
            Some(i64::from_le_bytes(raw))
        }
        other => {
            return Err(KeepError::SnapshotCorruption(format!(
                "invalid expiry flag {}",
                other
            )))
        }
    };

    Ok(CacheRecord {
        key,
        value,
        expires_at,
    })
}

fn read_u32<R: Read>(input: &mut R) -> Result<u32> {
    let mut raw = [0u8; 4];
    read_exact(input, &mut raw)?;
    Ok(u32::from_le_bytes(raw))
}

fn read_bytes<R: Read>(input: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let read = input
        .by_ref()
        .take(len as u64)
        .read_to_end(&mut buf)
        .map_err(|e| KeepError::SnapshotCorruption(format!("payload read failed: {}", e)))?;
    if read != len {
        return Err(KeepError::SnapshotCorruption(format!(
            "record truncated: {} of {} bytes",
            read, len
        )));
    }
    Ok(buf)
}

fn read_exact<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<()> {
    input.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => {
            KeepError::SnapshotCorruption("payload ended before the declared entry count".into())
        }
        _ => KeepError::SnapshotCorruption(format!("payload read failed: {}", e)),
    })
}

/// The payload must end exactly after the declared records
fn expect_end<R: Read>(input: &mut R) -> Result<()> {
    let mut extra = [0u8; 1];
    match input.read(&mut extra) {
        Ok(0) => Ok(()),
        Ok(_) => Err(KeepError::SnapshotCorruption(
            "trailing bytes after the declared entry count".into(),
        )),
        Err(e) => Err(KeepError::SnapshotCorruption(format!(
            "payload read failed: {}",
            e
        ))),
    }
}
