//! Error types for system operations

use thiserror::Error;

/// Main error type for system operations
#[derive(Error, Debug)]
pub enum SystemError {
    /// Platform-specific error
    #[error("Platform error: {message}")]
    PlatformError {
        /// Error message
        message: String,
        /// OS error code if available
        code: Option<i32>,
    },
}

/// Result type for system operations
pub type Result<T> = std::result::Result<T, SystemError>;

impl From<region::Error> for SystemError {
    fn from(err: region::Error) -> Self {
        Self::PlatformError {
            message: err.to_string(),
            code: None,
        }
    }
}
