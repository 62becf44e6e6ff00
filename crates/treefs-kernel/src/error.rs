//! Tree error types.

use std::io;

use rusqlite::ErrorCode;
use thiserror::Error;

/// Tree operation error.
#[derive(Debug, Error)]
pub enum TreeError {
    /// A path segment, file, or folder does not resolve.
    #[error("not found: {0}")]
    NotFound(String),

    /// Expected a folder.
    #[error("not a folder: {0}")]
    NotAFolder(String),

    /// Expected a file.
    #[error("not a file: {0}")]
    NotAFile(String),

    /// A sibling with this name already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A move would put a folder inside itself.
    #[error("cannot move {src} into its own subtree at {dst}")]
    CycleDetected { src: String, dst: String },

    /// A concurrent transaction invalidated this one. Retryable.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed name or path, or an operation the tree never allows.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Store failure that is none of the above.
    #[error("storage error: {0}")]
    Storage(rusqlite::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl TreeError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create a NotAFolder error.
    pub fn not_a_folder(path: impl Into<String>) -> Self {
        Self::NotAFolder(path.into())
    }

    /// Create a NotAFile error.
    pub fn not_a_file(path: impl Into<String>) -> Self {
        Self::NotAFile(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create a CycleDetected error.
    pub fn cycle(src: impl Into<String>, dst: impl Into<String>) -> Self {
        Self::CycleDetected {
            src: src.into(),
            dst: dst.into(),
        }
    }

    /// Create a Conflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create an InvalidArgument error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Only conflicts are retried; every other kind goes straight to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TreeError::Conflict(_))
    }
}

/// Classify store failures into tree error kinds.
///
/// Lock contention and stale snapshots are conflicts. A foreign-key failure
/// means the parent row vanished between our read and our write, which is
/// also a conflict: the retry re-resolves and reports `NotFound`.
impl From<rusqlite::Error> for TreeError {
    fn from(e: rusqlite::Error) -> Self {
        let rusqlite::Error::SqliteFailure(ref failure, ref msg) = e else {
            return TreeError::Storage(e);
        };
        let (code, extended) = (failure.code, failure.extended_code);
        let detail = msg.clone().unwrap_or_else(|| failure.to_string());
        match code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => TreeError::Conflict(detail),
            ErrorCode::ConstraintViolation => match extended {
                rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => TreeError::AlreadyExists(detail),
                rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => TreeError::Conflict(detail),
                rusqlite::ffi::SQLITE_CONSTRAINT_TRIGGER => TreeError::NotAFolder(detail),
                _ => TreeError::Storage(e),
            },
            _ => TreeError::Storage(e),
        }
    }
}

/// Convert TreeError to std::io::Error for compatibility.
impl From<TreeError> for io::Error {
    fn from(e: TreeError) -> Self {
        match e {
            TreeError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            TreeError::NotAFolder(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            TreeError::NotAFile(msg) => io::Error::new(io::ErrorKind::IsADirectory, msg),
            TreeError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            e @ TreeError::CycleDetected { .. } => {
                io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
            }
            TreeError::Conflict(msg) => io::Error::new(io::ErrorKind::ResourceBusy, msg),
            TreeError::InvalidArgument(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            e @ TreeError::Storage(_) => io::Error::other(e.to_string()),
            TreeError::Other(msg) => io::Error::other(msg),
        }
    }
}

/// Tree result type.
pub type TreeResult<T> = Result<T, TreeError>;
