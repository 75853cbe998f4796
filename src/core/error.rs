//! Error types for the storage bridge
//!
//! Every adapter translates its engine's failures into [`BridgeError`] at its boundary, so
//! callers can match on one error shape regardless of which backend failed. The engine's
//! original error is kept as the `source` and is reachable through [`BridgeError::cause`].

use super::value::Outcome;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Boxed native cause carried by [`BridgeError`]
pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Stable error taxonomy, independent of the backend that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Backend could not be opened or created
    Initialization,
    /// Operation attempted before a successful open
    NotInitialized,
    /// Caller-supplied arguments violate a precondition
    Validation,
    /// The underlying engine reported a failure
    NativeOperation,
    /// Illegal transaction nesting or use of a closed scope
    TransactionState,
    /// A best-effort batch stopped at a failing operation
    Batch,
    /// A value could not be encoded or decoded
    Serialization,
    /// Encryption or decryption failed
    Crypto,
    /// The caller stopped waiting for an operation
    Timeout,
}

/// The unified bridge error
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Backend could not be opened or created
    #[error("Initialization of {backend} failed: {message}")]
    Initialization {
        backend: &'static str,
        message: String,
        #[source]
        source: Option<Cause>,
    },

    /// Operation attempted before open or after close
    #[error("{backend} is not initialized")]
    NotInitialized { backend: &'static str },

    /// Caller-supplied arguments are invalid
    #[error("Validation error: {0}")]
    Validation(String),

    /// Failure reported by the underlying engine
    #[error("{backend} error: {message}")]
    NativeOperation {
        backend: &'static str,
        message: String,
        #[source]
        source: Cause,
    },

    /// Transaction scope misuse
    #[error("Transaction state error: {0}")]
    TransactionState(String),

    /// Best-effort batch stopped at `index`; earlier operations stay applied
    #[error("Batch aborted at operation {index} after {} applied: {source}", .completed.len())]
    BatchAborted {
        index: usize,
        completed: Vec<Outcome>,
        #[source]
        source: Box<BridgeError>,
    },

    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Encryption or key handling failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// The caller stopped waiting; the native call still runs to completion
    #[error("Operation timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl BridgeError {
    /// Create an initialization error without a native cause
    pub fn initialization(backend: &'static str, message: impl Into<String>) -> Self {
        BridgeError::Initialization {
            backend,
            message: message.into(),
            source: None,
        }
    }

    /// Create an initialization error wrapping the engine's failure
    pub fn initialization_with_source(
        backend: &'static str,
        message: impl Into<String>,
        source: impl Into<Cause>,
    ) -> Self {
        BridgeError::Initialization {
            backend,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a not-initialized error
    pub fn not_initialized(backend: &'static str) -> Self {
        BridgeError::NotInitialized { backend }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        BridgeError::Validation(msg.into())
    }

    /// Wrap a native engine failure
    pub fn native<E>(backend: &'static str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        BridgeError::NativeOperation {
            backend,
            message: source.to_string(),
            source: Box::new(source),
        }
    }

    /// Create a transaction state error
    pub fn transaction_state<S: Into<String>>(msg: S) -> Self {
        BridgeError::TransactionState(msg.into())
    }

    /// Create a crypto error
    pub fn crypto<S: Into<String>>(msg: S) -> Self {
        BridgeError::Crypto(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        BridgeError::Timeout { timeout_ms }
    }

    /// Stable kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Initialization { .. } => ErrorKind::Initialization,
            BridgeError::NotInitialized { .. } => ErrorKind::NotInitialized,
            BridgeError::Validation(_) => ErrorKind::Validation,
            BridgeError::NativeOperation { .. } => ErrorKind::NativeOperation,
            BridgeError::TransactionState(_) => ErrorKind::TransactionState,
            BridgeError::BatchAborted { .. } => ErrorKind::Batch,
            BridgeError::Serialization(_) => ErrorKind::Serialization,
            BridgeError::Crypto(_) => ErrorKind::Crypto,
            BridgeError::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// The wrapped native cause, if this error carries one
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            BridgeError::Initialization { source, .. } => source.as_deref(),
            BridgeError::NativeOperation { source, .. } => Some(source.as_ref()),
            BridgeError::BatchAborted { source, .. } => source.cause(),
            BridgeError::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::native("io", e)
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for BridgeError {
    fn from(e: rusqlite::Error) -> Self {
        BridgeError::native("sqlite", e)
    }
}

#[cfg(feature = "embedded")]
impl From<sled::Error> for BridgeError {
    fn from(e: sled::Error) -> Self {
        BridgeError::native("sled", e)
    }
}

impl From<tokio::task::JoinError> for BridgeError {
    fn from(e: tokio::task::JoinError) -> Self {
        BridgeError::native("runtime", e)
    }
}
