//! Error types for iris-online.

use thiserror::Error;

/// The error type used by every fallible iris-online operation.
///
/// Reopen steps do not return this type; they report expected failures through
/// the reopen context (see [`crate::reopen::ReopenFailure`]). `IrisError` is what
/// the collaborators underneath them (directories, the operation log, writes)
/// produce.
#[derive(Error, Debug)]
pub enum IrisError {
    /// I/O errors from the file directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors for versions, segments and configs.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Index-level errors (inconsistent segment or version state).
    #[error("Index error: {0}")]
    Index(String),

    /// Invalid arguments passed to an API.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration values.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A requested version, segment or document does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// On-disk data failed validation.
    #[error("Corruption: {0}")]
    Corruption(String),

    /// Unexpected internal state.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IrisError {
    pub fn index(msg: impl Into<String>) -> Self {
        IrisError::Index(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        IrisError::InvalidArgument(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        IrisError::InvalidConfig(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        IrisError::NotFound(msg.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        IrisError::Corruption(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        IrisError::Internal(msg.into())
    }

    /// Whether this error came from reading missing or damaged index files.
    pub fn is_io_failure(&self) -> bool {
        matches!(
            self,
            IrisError::Io(_) | IrisError::Json(_) | IrisError::NotFound(_) | IrisError::Corruption(_)
        )
    }
}

/// Result type alias for iris-online operations.
pub type Result<T> = std::result::Result<T, IrisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_and_display() {
        let err = IrisError::not_found("version 3");
        assert_eq!(err.to_string(), "Not found: version 3");
        assert!(err.is_io_failure());

        let err = IrisError::invalid_argument("bad field");
        assert!(!err.is_io_failure());
        assert_eq!(err.to_string(), "Invalid argument: bad field");
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: IrisError = io.into();
        assert!(matches!(err, IrisError::Io(_)));
        assert!(err.is_io_failure());
    }
}
