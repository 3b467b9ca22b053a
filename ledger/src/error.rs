//! Error types for the ledger engine.

use thiserror::Error;

/// Boxed error returned by caller-supplied hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// SQLSTATE for `serialization_failure`.
const SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE for `deadlock_detected`.
const DEADLOCK_DETECTED: &str = "40P01";

/// Main error type for ledger operations.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// A connection or transaction could not be obtained.
    #[error("Connection error: {0}")]
    Connection(#[source] sqlx::Error),

    /// Unique or foreign-key violation reported by the storage engine.
    #[error("Constraint violation ({code}): {message}")]
    ConstraintViolation {
        /// Engine-specific code (SQLSTATE).
        code: String,
        /// Violated constraint, when the engine reports it.
        constraint: Option<String>,
        /// Engine message.
        message: String,
    },

    /// The unit of work failed and the rollback failed too.
    #[error("Transaction failed: {source}; rollback failed: {rollback}")]
    Rollback {
        /// Error returned by the unit of work.
        source: Box<LedgerError>,
        /// Error returned by the rollback.
        rollback: Box<LedgerError>,
    },

    /// Row not found.
    #[error("{entity} not found: {key}")]
    NotFound {
        /// Table the lookup ran against.
        entity: &'static str,
        /// Lookup key.
        key: String,
    },

    /// Transfer parameters rejected before any write.
    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),

    /// The post-create hook of a user creation failed.
    #[error("After-create hook failed: {0}")]
    AfterCreate(#[source] BoxError),

    /// Any other storage engine error, unmodified.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal backend error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Create a not-found error.
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        LedgerError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// Check if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, LedgerError::NotFound { .. })
    }

    /// Check if the storage engine aborted the transaction because of a
    /// serialization failure or a detected deadlock.
    ///
    /// The engine never retries; this only lets callers decide.
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::Database(sqlx::Error::Database(db)) => matches!(
                db.code().as_deref(),
                Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED)
            ),
            LedgerError::Connection(_) => true,
            _ => false,
        }
    }

    /// Get error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::Connection(_) => "CONNECTION_ERROR",
            LedgerError::ConstraintViolation { .. } => "CONSTRAINT_VIOLATION",
            LedgerError::Rollback { .. } => "ROLLBACK_FAILED",
            LedgerError::NotFound { .. } => "NOT_FOUND",
            LedgerError::InvalidTransfer(_) => "INVALID_TRANSFER",
            LedgerError::AfterCreate(_) => "AFTER_CREATE_FAILED",
            LedgerError::Database(_) => "DATABASE_ERROR",
            LedgerError::Configuration(_) => "CONFIGURATION_ERROR",
            LedgerError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
