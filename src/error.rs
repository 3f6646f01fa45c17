//! Error types for the storage provider orchestration core
//!
//! Every failure the core surfaces maps onto an [`ErrorKind`], which carries a
//! stable numeric code and an HTTP-equivalent status so that RPC layers can
//! report errors uniformly.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the orchestration core
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Task Admission Errors
    // =========================================================================
    /// Nil task or nil required sub-field
    #[error("dangling pointer: {0}")]
    DanglingPointer(String),

    /// Account already owns the configured number of buckets
    #[error("account {account} owns {owned} buckets, limit is {limit}")]
    ExceedBucketNumber {
        account: String,
        owned: u64,
        limit: u64,
    },

    /// Task with the same key is already queued
    #[error("repeated task: {0}")]
    RepeatedTask(String),

    /// Queue is full and its retire strategy evicted nothing
    #[error("queue {queue} exceeded, cap {cap}")]
    ExceedQueue { queue: String, cap: usize },

    /// Resource reservation denied
    #[error("resource exceeded: {0}")]
    ResourceExceeded(String),

    // =========================================================================
    // Piece Pipeline Errors
    // =========================================================================
    /// Received piece bytes do not match the announced checksum
    #[error("invalid data checksum for piece {key}")]
    InvalidDataChecksum { key: String },

    /// Finalization attempted before every piece arrived
    #[error("unfinished task: expected {expected} piece checksums, have {actual}")]
    UnfinishedTask { expected: u32, actual: usize },

    /// Malformed piece key
    #[error("invalid piece key format: {0}")]
    InvalidKeyFormat(String),

    // =========================================================================
    // Quota Errors
    // =========================================================================
    /// Monthly read quota would be exceeded
    #[error("quota exceeded for bucket {bucket_id}: requested {requested}, remaining {remaining}")]
    QuotaExceeded {
        bucket_id: u64,
        requested: u64,
        remaining: u64,
    },

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// Chain query failed
    #[error("consensus error: {0}")]
    Consensus(String),

    /// Signer call failed
    #[error("signer error: {0}")]
    Signer(String),

    /// Piece store backend failed
    #[error("piece store error: {0}")]
    PieceStore(String),

    /// Persistence failed
    #[error("database error: {0}")]
    GfSpDb(String),

    /// SQL driver error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Row with the same primary key already exists
    #[error("duplicate entry: {0}")]
    Duplicate(String),

    /// Row or object not found
    #[error("not found: {0}")]
    NotFound(String),

    // =========================================================================
    // Ambient Errors
    // =========================================================================
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// TOML parse error
    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Hex decode error
    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error taxonomy shared by every failure of the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    DanglingPointer,
    ExceedBucketNumber,
    RepeatedTask,
    ExceedQueue,
    ResourceExceeded,
    InvalidDataChecksum,
    UnfinishedTask,
    QuotaExceeded,
    InvalidKeyFormat,
    Consensus,
    Signer,
    PieceStore,
    GfSpDb,
    Duplicate,
    NotFound,
    Config,
    Internal,
}

impl ErrorKind {
    /// HTTP-equivalent status used when surfacing the error.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::DanglingPointer
            | ErrorKind::InvalidDataChecksum
            | ErrorKind::InvalidKeyFormat
            | ErrorKind::Config => 400,
            ErrorKind::ExceedBucketNumber | ErrorKind::QuotaExceeded => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::RepeatedTask | ErrorKind::Duplicate => 409,
            ErrorKind::UnfinishedTask => 425,
            ErrorKind::ExceedQueue | ErrorKind::ResourceExceeded => 429,
            ErrorKind::Consensus
            | ErrorKind::Signer
            | ErrorKind::PieceStore
            | ErrorKind::GfSpDb
            | ErrorKind::Internal => 500,
        }
    }

    /// Stable numeric code reported to peers.
    pub fn code(&self) -> u32 {
        match self {
            ErrorKind::DanglingPointer => 10001,
            ErrorKind::ExceedBucketNumber => 10002,
            ErrorKind::RepeatedTask => 10003,
            ErrorKind::ExceedQueue => 10004,
            ErrorKind::ResourceExceeded => 20001,
            ErrorKind::InvalidKeyFormat => 30001,
            ErrorKind::InvalidDataChecksum => 80003,
            ErrorKind::UnfinishedTask => 80004,
            ErrorKind::GfSpDb | ErrorKind::Duplicate | ErrorKind::NotFound => 85101,
            ErrorKind::PieceStore => 85201,
            ErrorKind::Signer => 85301,
            ErrorKind::Consensus => 85401,
            ErrorKind::QuotaExceeded => 90001,
            ErrorKind::Config => 99001,
            ErrorKind::Internal => 99999,
        }
    }

    /// Whether a caller may retry the operation that produced this kind.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ExceedQueue
                | ErrorKind::ResourceExceeded
                | ErrorKind::UnfinishedTask
                | ErrorKind::Consensus
                | ErrorKind::Signer
                | ErrorKind::PieceStore
                | ErrorKind::GfSpDb
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Error {
    /// Classify this error into the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DanglingPointer(_) => ErrorKind::DanglingPointer,
            Error::ExceedBucketNumber { .. } => ErrorKind::ExceedBucketNumber,
            Error::RepeatedTask(_) => ErrorKind::RepeatedTask,
            Error::ExceedQueue { .. } => ErrorKind::ExceedQueue,
            Error::ResourceExceeded(_) => ErrorKind::ResourceExceeded,
            Error::InvalidDataChecksum { .. } => ErrorKind::InvalidDataChecksum,
            Error::UnfinishedTask { .. } => ErrorKind::UnfinishedTask,
            Error::InvalidKeyFormat(_) => ErrorKind::InvalidKeyFormat,
            Error::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            Error::Consensus(_) => ErrorKind::Consensus,
            Error::Signer(_) => ErrorKind::Signer,
            Error::PieceStore(_) => ErrorKind::PieceStore,
            Error::GfSpDb(_) | Error::Database(_) => ErrorKind::GfSpDb,
            Error::Duplicate(_) => ErrorKind::Duplicate,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Config(_) | Error::Toml(_) => ErrorKind::Config,
            Error::Json(_) | Error::Hex(_) | Error::Io(_) | Error::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// HTTP-equivalent status of this error.
    pub fn http_status(&self) -> u16 {
        self.kind().http_status()
    }

    /// Whether the operation may be retried.
    pub fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }

    /// Wrap a persistence failure, keeping its message under the `GfSpDb` kind.
    pub fn db(err: impl fmt::Display) -> Self {
        Error::GfSpDb(err.to_string())
    }
}

/// Cloneable record of a failure, stored on tasks and reported to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn code(&self) -> u32 {
        self.kind.code()
    }
}

impl From<&Error> for TaskError {
    fn from(err: &Error) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}] {}", self.kind, self.kind.code(), self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            Error::RepeatedTask("k".into()).kind(),
            ErrorKind::RepeatedTask
        );
        assert_eq!(
            Error::Database(sqlx::Error::RowNotFound).kind(),
            ErrorKind::GfSpDb
        );
        assert_eq!(
            Error::ExceedQueue {
                queue: "q".into(),
                cap: 1
            }
            .http_status(),
            429
        );
    }

    #[test]
    fn test_retriable_matches_recovery_column() {
        assert!(Error::UnfinishedTask {
            expected: 3,
            actual: 2
        }
        .is_retriable());
        assert!(Error::PieceStore("io".into()).is_retriable());
        assert!(!Error::DanglingPointer("task".into()).is_retriable());
        assert!(!Error::InvalidDataChecksum { key: "e1_s0_p0".into() }.is_retriable());
        assert!(!Error::QuotaExceeded {
            bucket_id: 1,
            requested: 11,
            remaining: 10
        }
        .is_retriable());
    }

    #[test]
    fn test_task_error_from_error() {
        let err = Error::Signer("timeout".into());
        let te = TaskError::from(&err);
        assert_eq!(te.kind, ErrorKind::Signer);
        assert_eq!(te.code(), 85301);
        assert!(te.to_string().contains("timeout"));
    }
}
