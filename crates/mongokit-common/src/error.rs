//! Error types for mongokit

use thiserror::Error;

/// Result type alias for mongokit operations
pub type Result<T> = std::result::Result<T, MongoKitError>;

/// Unified error type for all mongokit operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MongoKitError {
    #[error("MongoDB error: {0}")]
    MongoDB(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    /// Missing or malformed connection settings. Raised at init, never retried.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The server refused the transport connection. Never retried.
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Failure that may succeed if the whole operation is re-run
    #[error("Transient error: {0}")]
    Transient(String),

    /// A retried operation failed on every attempt of its budget
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// Closing the connection failed. Logged by the caller, never propagated.
    #[error("Shutdown error: {0}")]
    Shutdown(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MongoKitError {
    /// Returns true for errors that must surface immediately instead of being retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MongoKitError::InvalidConfiguration(_) | MongoKitError::ConnectionRefused(_)
        )
    }

    /// Returns true if re-running the failed operation may succeed
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal() && !matches!(self, MongoKitError::RetryExhausted { .. })
    }

    /// Returns true if this error reports a refused transport connection
    pub fn is_connection_refused(&self) -> bool {
        match self {
            MongoKitError::ConnectionRefused(_) => true,
            MongoKitError::MongoDB(msg) | MongoKitError::Connection(msg) => {
                is_connection_refused_message(msg)
            }
            _ => false,
        }
    }
}

/// Matches driver messages for a refused TCP connection
/// (`Connection refused (os error 111)`, `connect ECONNREFUSED 127.0.0.1:27017`).
pub fn is_connection_refused_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("connection refused") || lower.contains("econnrefused")
}

impl From<serde_json::Error> for MongoKitError {
    fn from(err: serde_json::Error) -> Self {
        MongoKitError::Serialization(err.to_string())
    }
}

// MongoDB-specific error conversions (when mongodb-errors feature is enabled)
#[cfg(feature = "mongodb-errors")]
impl From<mongodb::error::Error> for MongoKitError {
    fn from(err: mongodb::error::Error) -> Self {
        let message = err.to_string();
        if is_connection_refused_message(&message) {
            MongoKitError::ConnectionRefused(message)
        } else {
            MongoKitError::MongoDB(message)
        }
    }
}

#[cfg(feature = "mongodb-errors")]
impl From<bson::ser::Error> for MongoKitError {
    fn from(err: bson::ser::Error) -> Self {
        MongoKitError::Serialization(format!("BSON serialization error: {}", err))
    }
}

#[cfg(feature = "mongodb-errors")]
impl From<bson::de::Error> for MongoKitError {
    fn from(err: bson::de::Error) -> Self {
        MongoKitError::Deserialization(format!("BSON deserialization error: {}", err))
    }
}
