pub mod error;
pub mod signature;
pub mod tempfile;

pub use bstr::{BStr, BString, ByteSlice, ByteVec};
pub use error::UtilError;
pub use signature::Signature;

pub type Result<T> = std::result::Result<T, UtilError>;
