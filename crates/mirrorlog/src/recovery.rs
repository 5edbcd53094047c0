//! Startup scan and reconciliation of the two log files.
//!
//! Each file is scanned from offset 0 up to its first invalid record; a
//! torn suffix is indistinguishable from unwritten tail, so nothing past
//! that point is trusted. The two scans are then reconciled per sequence:
//! a record corrupted in one file is recovered from the other, and the log
//! is truncated at the first sequence present in neither.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::{debug, warn};

use crate::error::WalError;
use crate::record::{self, RecordHeader, HEADER_SIZE};

/// A record salvaged from one of the log files during startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredRecord {
    /// Sequence from the record header.
    pub sequence: u64,
    /// Owned copy of the payload.
    pub payload: Vec<u8>,
}

impl RecoveredRecord {
    /// Padded on-disk footprint of this record.
    #[must_use]
    pub fn padded_size(&self) -> u64 {
        record::padded_size(self.payload.len()) as u64
    }
}

/// Durable state reconstructed from both files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryState {
    /// Largest sequence for which the log is contiguously valid from 1.
    pub highest_sequence: u64,
    /// Offset at which the next record will be written.
    pub next_write_offset: u64,
    /// Number of sequences that survived reconciliation.
    pub valid_record_count: usize,
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool, WalError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(WalError::Io(e)),
    }
}

/// Scan a log file sequentially from offset 0.
///
/// Stops cleanly at the first invalid record: short header, framing error,
/// short payload, or checksum mismatch. A missing file is an empty log.
///
/// # Errors
///
/// Returns an error only for I/O failures other than end-of-file.
pub fn scan_log(path: &Path) -> Result<Vec<RecoveredRecord>, WalError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(WalError::OpenFailed {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut position: u64 = 0;

    loop {
        let mut header_bytes = [0u8; HEADER_SIZE];
        if !read_full(&mut reader, &mut header_bytes)? {
            break; // clean end of log
        }

        let header = match RecordHeader::parse(&header_bytes) {
            Ok(h) => h,
            Err(e) => {
                debug!(
                    path = %path.display(),
                    position,
                    error = %e,
                    "log scan stopped at framing error"
                );
                break;
            }
        };

        let mut payload = vec![0u8; header.length as usize];
        if !read_full(&mut reader, &mut payload)? {
            debug!(
                path = %path.display(),
                position,
                sequence = header.sequence,
                "log scan stopped at short payload"
            );
            break;
        }

        if record::checksum(header.sequence, header.length, &payload) != header.checksum {
            warn!(
                path = %path.display(),
                position,
                sequence = header.sequence,
                "checksum mismatch during recovery - truncating log"
            );
            break;
        }

        position += header.padded_size() as u64;
        records.push(RecoveredRecord {
            sequence: header.sequence,
            payload,
        });
        reader.seek(SeekFrom::Start(position))?;
    }

    Ok(records)
}

/// Reconcile the per-file scans into a recovery state plus the winning
/// record for every surviving sequence, in ascending order.
///
/// Starting at sequence 1, a sequence survives while at least one file
/// holds a valid record for it; the first gap truncates the log. When both
/// files hold a record, the primary copy wins (both receive identical
/// bytes, so the choice only matters after a hardware fault).
#[must_use]
pub fn reconcile(
    primary: Vec<RecoveredRecord>,
    secondary: Vec<RecoveredRecord>,
) -> (RecoveryState, Vec<RecoveredRecord>) {
    let mut by_sequence: BTreeMap<u64, RecoveredRecord> = BTreeMap::new();
    // Secondary first, so a primary copy of the same sequence replaces it.
    for record in secondary.into_iter().chain(primary) {
        by_sequence.insert(record.sequence, record);
    }

    let mut state = RecoveryState::default();
    let mut winners = Vec::new();
    let mut sequence = 1u64;
    while let Some(record) = by_sequence.remove(&sequence) {
        state.next_write_offset += record.padded_size();
        winners.push(record);
        sequence += 1;
    }

    state.highest_sequence = sequence - 1;
    state.valid_record_count = winners.len();

    if !by_sequence.is_empty() {
        warn!(
            discarded = by_sequence.len(),
            truncated_at = sequence,
            "discarding records beyond the first sequence gap"
        );
    }

    (state, winners)
}

/// Scan both files and reconcile them.
///
/// # Errors
///
/// Returns an error for I/O failures during either scan.
pub fn recover(
    primary_path: &Path,
    secondary_path: &Path,
) -> Result<(RecoveryState, Vec<RecoveredRecord>), WalError> {
    let primary = scan_log(primary_path)?;
    let secondary = scan_log(secondary_path)?;

    debug!(
        primary_records = primary.len(),
        secondary_records = secondary.len(),
        "scanned both log files"
    );

    Ok(reconcile(primary, secondary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    use crate::record::encode;

    fn write_log(dir: &TempDir, name: &str, records: &[(u64, &[u8])]) -> PathBuf {
        let path = dir.path().join(name);
        let mut bytes = Vec::new();
        for &(sequence, payload) in records {
            bytes.extend_from_slice(&encode(sequence, payload).unwrap());
        }
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_scan_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let records = scan_log(&dir.path().join("absent.wal")).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_scan_reads_all_records() {
        let dir = TempDir::new().unwrap();
        let path = write_log(&dir, "a.wal", &[(1, b"one"), (2, b"two"), (3, b"three")]);

        let records = scan_log(&path).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].sequence, 1);
        assert_eq!(records[0].payload, b"one");
        assert_eq!(records[2].payload, b"three");
    }

    #[test]
    fn test_scan_stops_at_checksum_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = write_log(&dir, "a.wal", &[(1, b"one"), (2, b"two")]);

        // Corrupt a payload byte of record 2 (record 2 starts at 512).
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[512 + 21] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let records = scan_log(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sequence, 1);
    }

    #[test]
    fn test_scan_stops_at_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = write_log(&dir, "a.wal", &[(1, b"one")]);

        // A torn suffix shorter than a header.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&[0xff; 7]);
        std::fs::write(&path, bytes).unwrap();

        let records = scan_log(&path).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_reconcile_empty() {
        let (state, winners) = reconcile(Vec::new(), Vec::new());
        assert_eq!(state, RecoveryState::default());
        assert!(winners.is_empty());
    }

    #[test]
    fn test_reconcile_identical_files() {
        let dir = TempDir::new().unwrap();
        let a = write_log(&dir, "a.wal", &[(1, b"one"), (2, b"two")]);
        let b = write_log(&dir, "b.wal", &[(1, b"one"), (2, b"two")]);

        let (state, winners) = recover(&a, &b).unwrap();
        assert_eq!(state.highest_sequence, 2);
        assert_eq!(state.valid_record_count, 2);
        assert_eq!(state.next_write_offset, 1024);
        assert_eq!(winners.len(), 2);
    }

    #[test]
    fn test_reconcile_truncates_at_gap() {
        // Sequences {1, 2, 3, 5} in primary, {1, 2} in secondary: sequence 4
        // is missing everywhere, so 5 is discarded.
        let dir = TempDir::new().unwrap();
        let a = write_log(
            &dir,
            "a.wal",
            &[(1, b"one"), (2, b"two"), (3, b"three"), (5, b"five")],
        );
        let b = write_log(&dir, "b.wal", &[(1, b"one"), (2, b"two")]);

        let (state, winners) = recover(&a, &b).unwrap();
        assert_eq!(state.highest_sequence, 3);
        assert_eq!(state.valid_record_count, 3);
        assert_eq!(winners.last().unwrap().sequence, 3);
    }

    #[test]
    fn test_reconcile_prefers_surviving_copy() {
        // Record 1 is corrupted in the primary; the secondary copy wins and
        // the log still reaches sequence 3.
        let dir = TempDir::new().unwrap();
        let a = write_log(&dir, "a.wal", &[(1, b"one"), (2, b"two"), (3, b"three")]);
        let b = write_log(&dir, "b.wal", &[(1, b"one"), (2, b"two"), (3, b"three")]);

        let mut bytes = std::fs::read(&a).unwrap();
        bytes[16..20].fill(0); // wipe record 1's checksum
        std::fs::write(&a, bytes).unwrap();

        let (state, winners) = recover(&a, &b).unwrap();
        assert_eq!(state.highest_sequence, 3);
        assert_eq!(winners[0].payload, b"one");
        assert_eq!(winners[1].payload, b"two");
    }

    #[test]
    fn test_reconcile_offsets_follow_winners() {
        let dir = TempDir::new().unwrap();
        let large = vec![0x42u8; 600]; // pads to 1024
        let a = write_log(&dir, "a.wal", &[(1, &large), (2, b"small")]);
        let b = write_log(&dir, "b.wal", &[]);

        let (state, _) = recover(&a, &b).unwrap();
        assert_eq!(state.next_write_offset, 1024 + 512);
    }

    #[test]
    fn test_empty_payload_record_recovers() {
        let dir = TempDir::new().unwrap();
        let a = write_log(&dir, "a.wal", &[(1, b"")]);
        let b = write_log(&dir, "b.wal", &[(1, b"")]);

        let (state, winners) = recover(&a, &b).unwrap();
        assert_eq!(state.highest_sequence, 1);
        assert!(winners[0].payload.is_empty());
    }
}
