//! Loose object storage: read, write, and enumerate uncompressed objects.
//!
//! Each loose object lives at `<objects_dir>/XX/YYYY...` where `XX` is the
//! first byte of the OID in hex and `YYYY...` is the rest. The file content
//! is the raw `"<type> <size>\0<content>"` bytes, with no compression.

mod enumerate;
mod read;
mod stream;
mod write;

pub use enumerate::LooseObjectIter;
pub use stream::LooseObjectStream;

use gitr_hash::ObjectId;
use std::path::{Path, PathBuf};

/// Interface to the loose object directory.
pub struct LooseObjectStore {
    /// Path to the objects directory.
    objects_dir: PathBuf,
}

impl LooseObjectStore {
    /// Open the loose object store at the given path.
    pub fn open(objects_dir: impl AsRef<Path>) -> Self {
        Self {
            objects_dir: objects_dir.as_ref().to_path_buf(),
        }
    }

    /// Get the file path for a given OID.
    pub fn object_path(&self, oid: &ObjectId) -> PathBuf {
        self.objects_dir.join(oid.loose_path())
    }
}

/// Errors from loose object operations.
#[derive(Debug, thiserror::Error)]
pub enum LooseError {
    #[error("corrupt loose object {oid}: {reason}")]
    Corrupt { oid: String, reason: String },

    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("object parse error: {0}")]
    Object(#[from] gitr_object::ObjectError),

    #[error("hash error: {0}")]
    Hash(#[from] gitr_hash::HashError),
}
