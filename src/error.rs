//! Error types for physical storage operations.
//!
//! Every driver maps its native failures onto [`PhysicalError`]; callers that
//! only care about the class of failure use [`PhysicalError::kind`].

use std::fmt;

use thiserror::Error;

/// The classes of failure callers can distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    NotReady,
    TooLarge,
    TooManyStatements,
    InvalidKey,
    Unsupported,
    Transient,
    Conflict,
    Protocol,
    Closed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not-found",
            ErrorKind::NotReady => "not-ready",
            ErrorKind::TooLarge => "too-large",
            ErrorKind::TooManyStatements => "too-many-statements",
            ErrorKind::InvalidKey => "invalid-key",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Transient => "transient",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during physical storage operations.
#[derive(Debug, Error)]
pub enum PhysicalError {
    /// Key does not exist in the store.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// No usable storage connection.
    #[error("backend not ready: {0}")]
    NotReady(String),

    /// Entry exceeds the driver's size limit.
    #[error("value for key {key} is too large: {size} bytes exceeds limit of {limit}")]
    TooLarge { key: String, size: usize, limit: usize },

    /// Transaction exceeds the driver's statement limit.
    #[error("transaction contains {count} operations, limit is {limit}")]
    TooManyStatements { count: usize, limit: usize },

    /// Key violates the driver or view key grammar.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Key is not valid UTF-8.
    #[error("key is not valid UTF-8: {0:?}")]
    InvalidEncoding(String),

    /// Key contains a non-printable character.
    #[error("key contains non-printable characters: {0:?}")]
    NonPrintable(String),

    /// Operation requires a capability the backend does not have.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Cannot connect to or communicate with the storage backend.
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// An HA lock attempt lost the race.
    #[error("lock conflict on {key}: held by {holder}")]
    LockConflict { key: String, holder: String },

    /// The backend returned something we could not interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Backend was already shut down.
    #[error("backend is closed")]
    Closed,

    /// Driver configuration is missing or malformed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// A generic transaction failed and its rollback was attempted.
    #[error("{cause}{}", format_rollback(.rollback))]
    Rollback {
        cause: Box<PhysicalError>,
        rollback: Vec<PhysicalError>,
    },

    /// Database error from SQLx.
    #[error("database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

fn format_rollback(errors: &[PhysicalError]) -> String {
    if errors.is_empty() {
        return String::new();
    }
    let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
    format!("; rollback failed: {}", joined.join("; "))
}

/// Result type alias for physical operations.
pub type Result<T> = std::result::Result<T, PhysicalError>;

impl PhysicalError {
    /// The class of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PhysicalError::KeyNotFound(_) => ErrorKind::NotFound,
            PhysicalError::NotReady(_) | PhysicalError::Config(_) => ErrorKind::NotReady,
            PhysicalError::TooLarge { .. } => ErrorKind::TooLarge,
            PhysicalError::TooManyStatements { .. } => ErrorKind::TooManyStatements,
            PhysicalError::InvalidKey(_)
            | PhysicalError::InvalidEncoding(_)
            | PhysicalError::NonPrintable(_) => ErrorKind::InvalidKey,
            PhysicalError::Unsupported(_) => ErrorKind::Unsupported,
            PhysicalError::ConnectionError(_) | PhysicalError::IoError(_) => ErrorKind::Transient,
            PhysicalError::LockConflict { .. } => ErrorKind::Conflict,
            PhysicalError::Protocol(_) | PhysicalError::SerializationError(_) => {
                ErrorKind::Protocol
            }
            PhysicalError::Closed => ErrorKind::Closed,
            PhysicalError::Rollback { cause, .. } => cause.kind(),
            PhysicalError::DatabaseError(err) => match err {
                sqlx::Error::PoolClosed => ErrorKind::Closed,
                sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => ErrorKind::Protocol,
                _ => ErrorKind::Transient,
            },
        }
    }

    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Conflict)
    }

    pub(crate) fn too_large(key: &str, size: usize, limit: usize) -> Self {
        PhysicalError::TooLarge {
            key: key.to_string(),
            size,
            limit,
        }
    }
}

impl From<serde_json::Error> for PhysicalError {
    fn from(err: serde_json::Error) -> Self {
        PhysicalError::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for PhysicalError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            PhysicalError::Protocol(err.to_string())
        } else {
            PhysicalError::ConnectionError(err.to_string())
        }
    }
}

impl From<object_store::Error> for PhysicalError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => PhysicalError::KeyNotFound(path),
            object_store::Error::InvalidPath { source } => {
                PhysicalError::InvalidKey(source.to_string())
            }
            object_store::Error::NotSupported { source } => {
                PhysicalError::Unsupported(source.to_string())
            }
            other => PhysicalError::ConnectionError(other.to_string()),
        }
    }
}
