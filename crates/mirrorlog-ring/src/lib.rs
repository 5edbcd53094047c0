//! `io_uring` submission/completion engine for the mirrorlog WAL.
//!
//! The WAL persists every record to two files by chaining an asynchronous
//! write to an fsync on a single submission ring. This crate owns the ring:
//! it creates it, encodes `(sequence, tag)` pairs into `user_data` words so
//! completions can be demultiplexed back to in-flight appends, pushes
//! write→fsync chains and verification reads, and drains the completion
//! queue.
//!
//! Linux only: the engine is built directly on `io_uring` (kernel 5.1+;
//! 5.11+ recommended for linked-fsync semantics) and makes no attempt at
//! portability.

mod config;
mod engine;
mod error;

pub use config::{RingConfig, RingConfigBuilder};
pub use engine::{
    decode_user_data, encode_user_data, RingCompletion, Tag, WalRing, MAX_SEQUENCE, TAG_BITS,
};
pub use error::RingError;
