//! mirrorlog: a crash-durable dual-file write-ahead log for Linux.
//!
//! Every appended record is written to two log files (ideally on distinct
//! physical devices) through `io_uring` write→fsync chains, so that a record
//! acknowledged by [`MirrorWal::flush`] survives process, kernel, and
//! single-device failures, including latent sector errors where a disk
//! acknowledged a write it can no longer read. On startup both files are
//! scanned and reconciled per sequence: a record corrupted in one file is
//! recovered from the other, and the log is truncated at the first sequence
//! missing from both.
//!
//! The contract is append/flush/replay:
//!
//! ```no_run
//! use mirrorlog::{MirrorWal, WalConfig};
//!
//! # fn main() -> Result<(), mirrorlog::WalError> {
//! let mut wal = MirrorWal::open("/mnt/a/wal.log", "/mnt/b/wal.log", WalConfig::default())?;
//! wal.append(b"first record")?;
//! wal.append(b"second record")?;
//! wal.flush()?; // both records durable on both files from here on
//!
//! wal.replay(|sequence, payload| {
//!     println!("{sequence}: {} bytes", payload.len());
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```
//!
//! A `MirrorWal` is a single-writer resource: `append` and `flush` must not
//! run concurrently. `append` only hands work to the kernel; durability is
//! acknowledged by `flush` alone.

pub mod buffer;
pub mod config;
pub mod error;
pub mod record;
pub mod recovery;
pub mod verify;
pub mod wal;

pub use config::{WalConfig, WalConfigBuilder};
pub use error::{DurabilityFault, RecordError, WalError};
pub use recovery::{RecoveredRecord, RecoveryState};
pub use verify::VerifyOutcome;
pub use wal::MirrorWal;
