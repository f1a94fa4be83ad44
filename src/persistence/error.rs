//! Error types for the persistence layer.

use thiserror::Error;

/// Errors that can occur in the persistence layer.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// A data store operation failed.
    #[error("{operation} failed: {source}")]
    OperationFailed {
        /// The operation that failed.
        operation: &'static str,
        /// The underlying driver error.
        #[source]
        source: sqlx::Error,
    },

    /// A data store operation exceeded the statement timeout.
    #[error("{operation} exceeded the statement timeout")]
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
    },

    /// The session's connection was busy serving another writer.
    #[error("{operation} found the database busy")]
    Busy {
        /// The operation that hit the busy condition.
        operation: &'static str,
    },

    /// The requested record was not found.
    #[error("record not found: {0}")]
    NotFound(String),

    /// A stored document could not be (de)serialized.
    #[error("failed to serialize or deserialize a stored document: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A schema migration failed.
    #[error("schema migration failed: {0}")]
    Migration(String),

    /// Invalid configuration or input.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl PersistenceError {
    /// Classifies a driver error, pulling out the busy/locked family so the
    /// caller can treat it as a defect distinct from ordinary failures.
    pub(crate) fn from_sqlx(operation: &'static str, error: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_error) = &error {
            let message = db_error.message();
            if message.contains("database is locked") || message.contains("table is locked") {
                return Self::Busy { operation };
            }
        }
        Self::OperationFailed { operation, source: error }
    }

    /// Whether this error counts toward a loop's consecutive-error budget as
    /// a session-discipline defect rather than an ordinary failure.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Busy { .. } | Self::Timeout { .. })
    }
}
