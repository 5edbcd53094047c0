//! Read-back verification of freshly persisted records.
//!
//! After a record's fsyncs complete, an optional verification pass reads the
//! bytes back from each file and decides whether the device really holds
//! what was written. A torn header and a wrong sector are indistinguishable
//! to the caller, so every structural failure collapses into
//! [`VerifyOutcome::Unreadable`]; a payload-checksum failure is reported
//! separately because its remediation (fetch the other copy) is different.

use crate::record::{self, RecordView};

/// Outcome of verifying a buffer read back from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome<'a> {
    /// The buffer holds the expected record, checksum intact.
    Valid(RecordView<'a>),
    /// Framing is intact but the payload checksum does not match.
    ChecksumMismatch {
        /// Checksum stored in the record header.
        expected: u32,
        /// Checksum recomputed from the buffer.
        actual: u32,
    },
    /// The buffer does not frame the expected record at all: short read,
    /// torn header, or a different record's sector.
    Unreadable,
}

impl VerifyOutcome<'_> {
    /// True when the buffer matched the expected record.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }
}

/// Check whether `buf` holds a valid copy of the record for
/// `expected_sequence`.
///
/// Checks in order: framing via the record codec, sequence against the
/// expectation, then the checksum.
#[must_use]
pub fn verify_buffer(buf: &[u8], expected_sequence: u64) -> VerifyOutcome<'_> {
    let Ok(view) = record::decode(buf) else {
        return VerifyOutcome::Unreadable;
    };

    if view.sequence != expected_sequence {
        return VerifyOutcome::Unreadable;
    }

    let actual = record::checksum(view.sequence, view.length(), view.payload);
    if actual != view.checksum {
        return VerifyOutcome::ChecksumMismatch {
            expected: view.checksum,
            actual,
        };
    }

    VerifyOutcome::Valid(view)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::encode;

    #[test]
    fn test_valid_record() {
        let buf = encode(3, b"intact").unwrap();
        let outcome = verify_buffer(&buf, 3);
        assert!(outcome.is_valid());
        match outcome {
            VerifyOutcome::Valid(view) => assert_eq!(view.payload, b"intact"),
            other => panic!("expected Valid, got {other:?}"),
        }
    }

    #[test]
    fn test_corrupted_payload_is_checksum_mismatch() {
        let mut buf = encode(3, b"intact").unwrap();
        buf[24] ^= 0x01;
        assert!(matches!(
            verify_buffer(&buf, 3),
            VerifyOutcome::ChecksumMismatch { .. }
        ));
    }

    #[test]
    fn test_wrong_sequence_is_unreadable() {
        let buf = encode(3, b"intact").unwrap();
        assert_eq!(verify_buffer(&buf, 4), VerifyOutcome::Unreadable);
    }

    #[test]
    fn test_torn_header_is_unreadable() {
        let mut buf = encode(3, b"intact").unwrap();
        buf[0..4].fill(0);
        assert_eq!(verify_buffer(&buf, 3), VerifyOutcome::Unreadable);
    }

    #[test]
    fn test_short_buffer_is_unreadable() {
        assert_eq!(verify_buffer(&[0u8; 8], 1), VerifyOutcome::Unreadable);
    }
}
