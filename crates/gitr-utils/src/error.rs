/// Base error type for gitr-utils operations.
#[derive(Debug, thiserror::Error)]
pub enum UtilError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
