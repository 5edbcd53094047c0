//! Error types for the mirrorlog WAL.

use std::io;
use std::path::PathBuf;

use mirrorlog_ring::RingError;

/// Structural (framing) errors from the record codec.
///
/// Recovery treats these as end-of-log markers; the verifier treats them as
/// unreadable buffers. They never poison a WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// The buffer does not open with the record magic.
    #[error("invalid record magic {found:#010x}")]
    InvalidMagic {
        /// The four bytes found where the magic belongs.
        found: u32,
    },

    /// Record sequences are non-zero by construction.
    #[error("record sequence must be non-zero")]
    InvalidSequence,

    /// The header's length field overruns the buffer.
    #[error("record length {length} overruns the {available}-byte buffer")]
    InvalidLength {
        /// Payload length claimed by the header.
        length: u32,
        /// Bytes actually available.
        available: usize,
    },

    /// The buffer cannot hold even a record header.
    #[error("buffer of {len} bytes is too small for a record header")]
    BufferTooSmall {
        /// Bytes available.
        len: usize,
    },

    /// The payload exceeds what the length field can express.
    #[error("payload of {len} bytes exceeds the record size limit")]
    PayloadTooLarge {
        /// Requested payload length.
        len: usize,
    },
}

/// The specific fault that cost an in-flight append its durability.
#[derive(Debug, thiserror::Error)]
pub enum DurabilityFault {
    /// A write to one of the files failed.
    #[error("write failed: {0}")]
    WriteFailed(#[source] io::Error),

    /// An fsync of one of the files failed (or was cancelled by its linked
    /// write failing).
    #[error("fsync failed: {0}")]
    FsyncFailed(#[source] io::Error),

    /// A verification read failed.
    #[error("verification read failed: {0}")]
    ReadFailed(#[source] io::Error),

    /// A verification read returned a well-framed record whose checksum
    /// does not match.
    #[error("verification found checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum stored in the record header.
        expected: u32,
        /// Checksum recomputed from the read-back bytes.
        actual: u32,
    },

    /// A verification read returned bytes that do not frame the expected
    /// record at all.
    #[error("verification read returned an unreadable record")]
    Unreadable,
}

/// Errors surfaced by WAL operations.
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    /// A log file could not be created or opened.
    #[error("failed to open log file {path}: {source}")]
    OpenFailed {
        /// The offending path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// An aligned buffer could not be allocated.
    #[error("failed to allocate a {bytes}-byte aligned buffer")]
    AllocationFailed {
        /// Requested allocation size.
        bytes: usize,
    },

    /// Record framing error.
    #[error("record framing error: {0}")]
    Record(#[from] RecordError),

    /// Submission ring error.
    #[error("ring error: {0}")]
    Ring(#[from] RingError),

    /// The submission ring has no room for another append; flush first.
    #[error("submission ring has no room for another append")]
    RingFull,

    /// One or both files reported an error for an in-flight record. The
    /// WAL is poisoned; reopen it to recover.
    #[error("durability lost for sequence {sequence}: {fault}")]
    OperationFailed {
        /// Sequence of the record that lost durability.
        sequence: u64,
        /// What went wrong.
        #[source]
        fault: DurabilityFault,
    },

    /// A completion arrived for a sequence with no pending operation.
    /// This is a protocol bug, never an I/O fault.
    #[error("completion for sequence {0} matches no pending operation")]
    UnknownSequence(u64),

    /// The WAL was poisoned by an earlier durability failure; close and
    /// reopen it to recover.
    #[error("WAL is poisoned by an earlier durability failure")]
    Poisoned,

    /// I/O error outside the ring (recovery-path reads).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A replay callback rejected a record.
    #[error("replay callback failed: {0}")]
    Callback(#[source] Box<dyn std::error::Error + Send + Sync>),
}
