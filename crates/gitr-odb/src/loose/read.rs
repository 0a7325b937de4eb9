use std::fs;

use gitr_hash::hasher::Hasher;
use gitr_object::header;
use gitr_object::{Object, ObjectType};

use crate::{LooseError, LooseObjectStore};

impl LooseObjectStore {
    /// Check if a loose object exists.
    pub fn contains(&self, oid: &gitr_hash::ObjectId) -> bool {
        self.object_path(oid).is_file()
    }

    /// Read a loose object by OID.
    ///
    /// Returns `Ok(None)` if the object does not exist.
    /// Returns `Err` if the object exists but is corrupt.
    pub fn read(&self, oid: &gitr_hash::ObjectId) -> Result<Option<Object>, LooseError> {
        let path = self.object_path(oid);
        let raw = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LooseError::Io(e)),
        };

        let obj = Object::parse(&raw)?;
        Ok(Some(obj))
    }

    /// Read just the header (type + size) without reading the full content.
    ///
    /// Returns `Ok(None)` if the object does not exist.
    pub fn read_header(
        &self,
        oid: &gitr_hash::ObjectId,
    ) -> Result<Option<(ObjectType, usize)>, LooseError> {
        let path = self.object_path(oid);
        // Headers are typically < 32 bytes, so 64 is plenty of room.
        let raw = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LooseError::Io(e)),
        };
        let window = &raw[..raw.len().min(64)];
        if !window.contains(&0) {
            return Err(LooseError::Corrupt {
                oid: oid.to_hex(),
                reason: "header exceeds 64 bytes".into(),
            });
        }

        let (obj_type, content_size, _header_len) = header::parse_header(window)?;
        Ok(Some((obj_type, content_size)))
    }

    /// Read a loose object and verify its hash matches the expected OID.
    ///
    /// Returns `Ok(None)` if the object does not exist.
    pub fn read_verified(
        &self,
        oid: &gitr_hash::ObjectId,
    ) -> Result<Option<Object>, LooseError> {
        let path = self.object_path(oid);
        let raw = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LooseError::Io(e)),
        };

        // Verify hash of the raw file content (header + content).
        let actual_oid = Hasher::digest(&raw)?;
        if actual_oid != *oid {
            return Err(LooseError::HashMismatch {
                path,
                expected: oid.to_hex(),
                actual: actual_oid.to_hex(),
            });
        }

        let obj = Object::parse(&raw)?;
        Ok(Some(obj))
    }
}
