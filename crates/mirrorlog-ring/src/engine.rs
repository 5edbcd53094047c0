//! Ring creation, chained submissions, and completion demultiplexing.
//!
//! Every submission queue entry carries an opaque 64-bit `user_data` word
//! packing the record sequence into the high 56 bits and an operation
//! [`Tag`] into the low byte. Completions decode the word back so the WAL
//! can locate the in-flight append they belong to.

use std::io;
use std::os::unix::io::RawFd;

use io_uring::squeue;
use io_uring::types::Fd;
use io_uring::{opcode, IoUring};
use tracing::debug;

use crate::config::RingConfig;
use crate::error::RingError;

/// Bits of `user_data` reserved for the operation tag.
pub const TAG_BITS: u32 = 8;

/// Largest sequence number representable in a `user_data` word.
pub const MAX_SEQUENCE: u64 = (1 << 56) - 1;

/// Operation tag carried in the low byte of `user_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Tag {
    /// Write of the record to the primary file.
    PrimaryWrite = 0,
    /// Fsync of the primary file, linked to the primary write.
    PrimaryFsync = 1,
    /// Read-back of the record from the primary file.
    PrimaryVerify = 2,
    /// Write of the record to the secondary file.
    SecondaryWrite = 3,
    /// Fsync of the secondary file, linked to the secondary write.
    SecondaryFsync = 4,
    /// Read-back of the record from the secondary file.
    SecondaryVerify = 5,
}

impl Tag {
    /// Decode a tag byte.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::PrimaryWrite),
            1 => Some(Self::PrimaryFsync),
            2 => Some(Self::PrimaryVerify),
            3 => Some(Self::SecondaryWrite),
            4 => Some(Self::SecondaryFsync),
            5 => Some(Self::SecondaryVerify),
            _ => None,
        }
    }

    /// True for the write half of a write→fsync chain.
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::PrimaryWrite | Self::SecondaryWrite)
    }

    /// True for the fsync half of a write→fsync chain.
    #[must_use]
    pub const fn is_fsync(self) -> bool {
        matches!(self, Self::PrimaryFsync | Self::SecondaryFsync)
    }

    /// True for verification reads.
    #[must_use]
    pub const fn is_verify(self) -> bool {
        matches!(self, Self::PrimaryVerify | Self::SecondaryVerify)
    }

    /// True when the tag addresses the primary file.
    #[must_use]
    pub const fn is_primary(self) -> bool {
        matches!(
            self,
            Self::PrimaryWrite | Self::PrimaryFsync | Self::PrimaryVerify
        )
    }
}

/// Pack a sequence and tag into a `user_data` word.
#[must_use]
pub fn encode_user_data(sequence: u64, tag: Tag) -> u64 {
    debug_assert!(sequence <= MAX_SEQUENCE, "sequence overflows user_data");
    (sequence << TAG_BITS) | tag as u64
}

/// Split a `user_data` word back into its sequence and tag.
///
/// # Errors
///
/// Returns [`RingError::UnknownUserData`] if the tag byte is not one this
/// engine issues; that is a protocol violation, not an I/O fault.
pub fn decode_user_data(user_data: u64) -> Result<(u64, Tag), RingError> {
    #[allow(clippy::cast_possible_truncation)]
    let tag = Tag::from_u8((user_data & 0xff) as u8)
        .ok_or(RingError::UnknownUserData(user_data))?;
    Ok((user_data >> TAG_BITS, tag))
}

/// A harvested completion, already demultiplexed into sequence and tag.
#[derive(Debug, Clone, Copy)]
pub struct RingCompletion {
    /// Sequence of the record this completion belongs to.
    pub sequence: u64,
    /// Which of the record's operations completed.
    pub tag: Tag,
    /// Raw CQE result: bytes transferred, or negative errno.
    pub result: i32,
}

impl RingCompletion {
    /// Check if the operation succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.result >= 0
    }

    /// Get the error if the operation failed.
    #[must_use]
    pub fn error(&self) -> Option<io::Error> {
        if self.result < 0 {
            Some(io::Error::from_raw_os_error(-self.result))
        } else {
            None
        }
    }
}

/// The submission ring owned by a single WAL instance.
///
/// Not thread-safe: the WAL is a single-writer resource and so is its ring.
pub struct WalRing {
    ring: IoUring,
    entries: u32,
}

impl std::fmt::Debug for WalRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalRing")
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

impl WalRing {
    /// Create a new ring from the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the kernel
    /// refuses the ring.
    pub fn new(config: &RingConfig) -> Result<Self, RingError> {
        config.validate()?;

        let ring = IoUring::builder()
            .build(config.entries)
            .map_err(RingError::Creation)?;

        debug!(entries = config.entries, "created submission ring");

        Ok(Self {
            ring,
            entries: config.entries,
        })
    }

    /// Get the number of submission queue entries.
    #[must_use]
    pub const fn entries(&self) -> u32 {
        self.entries
    }

    /// Number of free submission queue slots.
    #[must_use]
    pub fn sq_space_left(&mut self) -> usize {
        let mut sq = self.ring.submission();
        sq.sync();
        sq.capacity() - sq.len()
    }

    /// Queue a write→fsync chain against `fd`.
    ///
    /// The write carries `IO_LINK`, so the fsync does not start until the
    /// write succeeds; a failed write cancels the fsync, which then surfaces
    /// its own failure completion. Both entries are queued atomically.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::SubmissionQueueFull`] if fewer than two slots
    /// are free.
    ///
    /// # Safety
    ///
    /// `buf` must point to `len` readable bytes that remain valid, at a
    /// stable address, until both completions for this chain have been
    /// harvested via [`drain_completions`](Self::drain_completions).
    pub unsafe fn submit_write_chain(
        &mut self,
        fd: RawFd,
        buf: *const u8,
        len: u32,
        offset: u64,
        sequence: u64,
        write_tag: Tag,
        fsync_tag: Tag,
    ) -> Result<(), RingError> {
        let write = opcode::Write::new(Fd(fd), buf, len)
            .offset(offset)
            .build()
            .flags(squeue::Flags::IO_LINK)
            .user_data(encode_user_data(sequence, write_tag));
        let fsync = opcode::Fsync::new(Fd(fd))
            .build()
            .user_data(encode_user_data(sequence, fsync_tag));

        // SAFETY: the caller guarantees the buffer outlives the chain.
        unsafe {
            self.ring
                .submission()
                .push_multiple(&[write, fsync])
                .map_err(|_| RingError::SubmissionQueueFull)?;
        }

        Ok(())
    }

    /// Queue a verification read of `len` bytes at `offset` into `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::SubmissionQueueFull`] if no slot is free.
    ///
    /// # Safety
    ///
    /// `buf` must point to `len` writable bytes that remain valid, at a
    /// stable address, until the completion for this read has been
    /// harvested.
    pub unsafe fn submit_verify_read(
        &mut self,
        fd: RawFd,
        buf: *mut u8,
        len: u32,
        offset: u64,
        sequence: u64,
        tag: Tag,
    ) -> Result<(), RingError> {
        let read = opcode::Read::new(Fd(fd), buf, len)
            .offset(offset)
            .build()
            .user_data(encode_user_data(sequence, tag));

        // SAFETY: the caller guarantees the buffer outlives the read.
        unsafe {
            self.ring
                .submission()
                .push(&read)
                .map_err(|_| RingError::SubmissionQueueFull)?;
        }

        Ok(())
    }

    /// Hand queued entries to the kernel without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the submit syscall fails.
    pub fn submit(&mut self) -> Result<usize, RingError> {
        self.ring.submit().map_err(RingError::SubmissionFailed)
    }

    /// Hand queued entries to the kernel and block until at least `want`
    /// completions are available. Interrupted waits are retried.
    ///
    /// # Errors
    ///
    /// Returns an error if the wait fails for any reason other than a
    /// signal.
    pub fn submit_and_wait(&mut self, want: usize) -> Result<usize, RingError> {
        loop {
            match self.ring.submit_and_wait(want) {
                Ok(submitted) => return Ok(submitted),
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => {}
                Err(e) => return Err(RingError::WaitFailed(e)),
            }
        }
    }

    /// Drain every ready completion, decoding each `user_data` word.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::UnknownUserData`] if a completion carries a tag
    /// byte this engine never issues.
    pub fn drain_completions(&mut self) -> Result<Vec<RingCompletion>, RingError> {
        let mut completions = Vec::new();
        for cqe in self.ring.completion() {
            let (sequence, tag) = decode_user_data(cqe.user_data())?;
            completions.push(RingCompletion {
                sequence,
                tag,
                result: cqe.result(),
            });
        }
        Ok(completions)
    }
}
