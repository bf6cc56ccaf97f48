//! Error types for shardmeta
//!
//! Every failure carries a stable [`ErrorKind`] that callers can match on.
//! Layers above the storage add [`Error::Context`] frames naming the operation
//! and the entities involved; the root cause is always kept as the innermost
//! frame.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Matchable classification of an [`Error`], independent of context frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    AlreadyExists,
    NotFound,
    Allocation,
    Storage,
    Placement,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Allocation => "allocation",
            ErrorKind::Storage => "storage",
            ErrorKind::Placement => "placement",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    // === Request Errors ===
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // === Allocation Errors ===
    #[error("ID allocation failed in namespace {namespace}: {reason}")]
    Allocation { namespace: String, reason: String },

    #[error("ID counter for namespace {namespace} not persisted: {source}")]
    CounterPersist {
        namespace: String,
        #[source]
        source: Box<Error>,
    },

    // === Storage Errors ===
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Metadata corrupted: {0}")]
    MetadataCorrupted(String),

    #[error("Storage error: {0}")]
    Storage(String),

    // === Placement Errors ===
    #[error("Shard placement failed for cluster {cluster}: {source}")]
    Placement {
        cluster: String,
        #[source]
        source: Box<Error>,
    },

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Classification of this error, looking through context frames.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::InvalidConfig(_) => ErrorKind::Validation,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Allocation { .. } | Error::CounterPersist { .. } => ErrorKind::Allocation,
            Error::RocksDb(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::MetadataCorrupted(_)
            | Error::Storage(_) => ErrorKind::Storage,
            Error::Placement { .. } => ErrorKind::Placement,
            Error::Internal(_) => ErrorKind::Internal,
            Error::Context { source, .. } => source.kind(),
        }
    }

    /// Innermost error, with every context frame stripped.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Wrap this error in a context frame.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Is this error worth retrying at the transport layer?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Storage | ErrorKind::Allocation | ErrorKind::Placement
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::AlreadyExists => StatusCode::CONFLICT,
            ErrorKind::Placement => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Allocation | ErrorKind::Storage | ErrorKind::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Attach context frames to fallible results.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| Into::<Error>::into(e).context(context))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| Into::<Error>::into(e).context(f()))
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Error::Internal(format!("lock poisoned: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_survives_context() {
        let err = Error::NotFound("cluster db1".into())
            .context("get cluster")
            .context("clusters manager GetShards");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.is_not_found());
        assert!(matches!(err.root(), Error::NotFound(_)));
    }

    #[test]
    fn test_display_keeps_chain() {
        let err: Result<()> = Err(Error::Storage("disk full".into()));
        let err = err.context("persist shard 3").unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("persist shard 3"));
        assert!(msg.contains("disk full"));
    }

    #[test]
    fn test_placement_kind_and_status() {
        let err = Error::Placement {
            cluster: "db1".into(),
            source: Box::new(Error::Storage("io".into())),
        };
        assert_eq!(err.kind(), ErrorKind::Placement);
        assert!(err.is_retryable());
        assert_eq!(
            err.to_http_status(),
            axum::http::StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_http_status_mapping() {
        use axum::http::StatusCode;
        assert_eq!(
            Error::Validation("x".into()).to_http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::AlreadyExists("x".into()).to_http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::NotFound("x".into()).context("op").to_http_status(),
            StatusCode::NOT_FOUND
        );
        assert!(!Error::NotFound("x".into()).is_retryable());
    }
}
