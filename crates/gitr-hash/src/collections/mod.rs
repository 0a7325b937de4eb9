//! Specialized collections keyed by [`crate::ObjectId`].

mod oid_map;

pub use oid_map::OidMap;
