//! On-disk record framing, checksums, and parsing.
//!
//! Record format on disk, all integers little-endian:
//!
//! - header (20 bytes):
//!   - magic: 4 bytes (`0x57414C52`, "WALR")
//!   - sequence: 8 bytes, non-zero
//!   - length: 4 bytes (payload length)
//!   - checksum: 4 bytes (CRC-32C of sequence ‖ length ‖ payload)
//! - payload: `length` bytes
//! - padding: zero bytes to the next 512-byte boundary
//!
//! Padding keeps every record at a direct-I/O-legal offset and size, so a
//! record can be written or read back with a single aligned transfer.

use crate::buffer::{AlignedBuf, BLOCK_SIZE};
use crate::error::{RecordError, WalError};

/// Magic opening every record header ("WALR" when read as little-endian).
pub const RECORD_MAGIC: u32 = 0x5741_4C52;

/// Fixed header size: magic + sequence + length + checksum.
pub const HEADER_SIZE: usize = 20;

/// Largest payload a record can carry without its length field wrapping.
pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize - HEADER_SIZE;

/// Padded on-disk footprint of a record carrying `payload_len` bytes.
#[must_use]
pub const fn padded_size(payload_len: usize) -> usize {
    (HEADER_SIZE + payload_len + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE
}

fn read_u32_le(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64_le(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// Parsed header fields of an on-disk record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Sequence assigned by the WAL, ≥ 1.
    pub sequence: u64,
    /// Payload length in bytes.
    pub length: u32,
    /// CRC-32C stored in the header.
    pub checksum: u32,
}

impl RecordHeader {
    /// Parse and validate the fixed header at the front of `buf`.
    ///
    /// Validates the magic, then the sequence. The length field is returned
    /// as-is; [`decode`] additionally checks it against the buffer bounds.
    ///
    /// # Errors
    ///
    /// Returns a framing error; safe on arbitrary input.
    pub fn parse(buf: &[u8]) -> Result<Self, RecordError> {
        if buf.len() < HEADER_SIZE {
            return Err(RecordError::BufferTooSmall { len: buf.len() });
        }

        let magic = read_u32_le(buf, 0);
        if magic != RECORD_MAGIC {
            return Err(RecordError::InvalidMagic { found: magic });
        }

        let sequence = read_u64_le(buf, 4);
        if sequence == 0 {
            return Err(RecordError::InvalidSequence);
        }

        Ok(Self {
            sequence,
            length: read_u32_le(buf, 12),
            checksum: read_u32_le(buf, 16),
        })
    }

    /// Padded on-disk footprint of the record this header describes.
    #[must_use]
    pub const fn padded_size(&self) -> usize {
        padded_size(self.length as usize)
    }
}

/// A decoded record borrowing its payload from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordView<'a> {
    /// Sequence from the header.
    pub sequence: u64,
    /// Checksum from the header.
    pub checksum: u32,
    /// Payload bytes within the input buffer.
    pub payload: &'a [u8],
}

impl RecordView<'_> {
    /// Payload length as stored in the header.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_PAYLOAD_SIZE
    pub fn length(&self) -> u32 {
        self.payload.len() as u32
    }
}

/// Encode a record into an owned, direct-I/O-aligned buffer.
///
/// The buffer is exactly [`padded_size`] bytes: header filled in, payload
/// copied, tail zeroed.
///
/// # Errors
///
/// Fails with [`RecordError::InvalidSequence`] for sequence 0,
/// [`RecordError::PayloadTooLarge`] past [`MAX_PAYLOAD_SIZE`], or an
/// allocation failure.
pub fn encode(sequence: u64, payload: &[u8]) -> Result<AlignedBuf, WalError> {
    if sequence == 0 {
        return Err(RecordError::InvalidSequence.into());
    }
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(RecordError::PayloadTooLarge { len: payload.len() }.into());
    }

    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_PAYLOAD_SIZE
    let length = payload.len() as u32;
    let crc = checksum(sequence, length, payload);

    let mut buf = AlignedBuf::zeroed(padded_size(payload.len()))?;
    buf[0..4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
    buf[4..12].copy_from_slice(&sequence.to_le_bytes());
    buf[12..16].copy_from_slice(&length.to_le_bytes());
    buf[16..20].copy_from_slice(&crc.to_le_bytes());
    buf[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(payload);

    Ok(buf)
}

/// Decode a record from `buf` without verifying its checksum.
///
/// Validation order: buffer size, magic, sequence, length-vs-bounds. A
/// length that overruns the buffer fails with [`RecordError::InvalidLength`]
/// rather than reading past the end; the function is total on adversarial
/// input.
///
/// # Errors
///
/// Returns a framing error describing the first check that failed.
pub fn decode(buf: &[u8]) -> Result<RecordView<'_>, RecordError> {
    let header = RecordHeader::parse(buf)?;

    let length = header.length as usize;
    if length > buf.len() - HEADER_SIZE {
        return Err(RecordError::InvalidLength {
            length: header.length,
            available: buf.len(),
        });
    }

    Ok(RecordView {
        sequence: header.sequence,
        checksum: header.checksum,
        payload: &buf[HEADER_SIZE..HEADER_SIZE + length],
    })
}

/// CRC-32C over the canonical input: sequence-LE(8) ‖ length-LE(4) ‖ payload.
#[must_use]
pub fn checksum(sequence: u64, length: u32, payload: &[u8]) -> u32 {
    let crc = crc32c::crc32c(&sequence.to_le_bytes());
    let crc = crc32c::crc32c_append(crc, &length.to_le_bytes());
    crc32c::crc32c_append(crc, payload)
}

/// Recompute the checksum of `record` and compare it to the stored value.
#[must_use]
pub fn verify_checksum(record: &RecordView<'_>) -> bool {
    checksum(record.sequence, record.length(), record.payload) == record.checksum
}
