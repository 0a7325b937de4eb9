//! Content-addressed identifiers for gitr-pack.
//!
//! This crate provides the `ObjectId` type (a fixed 20-byte SHA-1 digest),
//! hex encoding/decoding, a one-shot and incremental hasher, and the 256-way
//! fan-out table used to accelerate identifier lookups in a sorted index.
//!
//! Only SHA-1 is supported: the identifier is fixed at 20 bytes by design,
//! not pluggable.

mod error;
pub mod hex;
mod oid;
pub mod hasher;
pub mod collections;
pub mod fanout;

pub use error::HashError;
pub use hasher::Hasher;
pub use oid::ObjectId;

/// Length in bytes of a SHA-1 digest.
pub const HASH_LEN: usize = 20;

/// Length in hex characters of a SHA-1 digest's canonical textual form.
pub const HEX_LEN: usize = 40;
