//! Error types shared across simplebank crates.

use thiserror::Error;

/// Validation errors for shared value types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    /// Currency code is not one of the supported currencies.
    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(String),
}

impl CommonError {
    /// Get error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            CommonError::UnsupportedCurrency(_) => "UNSUPPORTED_CURRENCY",
        }
    }
}
