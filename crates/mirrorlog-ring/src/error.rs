//! Error types for ring operations.

use std::io;

/// Errors that can occur while driving the submission ring.
#[derive(Debug, thiserror::Error)]
pub enum RingError {
    /// Failed to create the `io_uring` ring.
    #[error("failed to create io_uring ring: {0}")]
    Creation(#[source] io::Error),

    /// Submission queue has no room for the requested entries.
    #[error("submission queue is full")]
    SubmissionQueueFull,

    /// Handing queued entries to the kernel failed.
    #[error("submission failed: {0}")]
    SubmissionFailed(#[source] io::Error),

    /// Waiting for completions failed.
    #[error("wait for completions failed: {0}")]
    WaitFailed(#[source] io::Error),

    /// Invalid ring configuration.
    #[error("invalid ring configuration: {0}")]
    InvalidConfig(String),

    /// A completion carried a `user_data` word this engine never issued.
    #[error("completion carries unknown user_data {0:#018x}")]
    UnknownUserData(u64),
}

impl RingError {
    /// Check if this error indicates a transient condition the caller can
    /// retry after draining completions.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::SubmissionQueueFull)
    }

    /// Check if this error means the ring can no longer be used.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Creation(_) | Self::UnknownUserData(_))
    }
}
