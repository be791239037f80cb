//! Error taxonomy of the transfer engine.
//!
//! Every per-file error ends up in the `error` of that file's
//! [`TransferResult`](super::TransferResult); only [`TransferError::Session`]
//! stops work, and only for the session it belongs to.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::fs::FsError;

/// A rename or removal that kept failing with a lock-class error.
///
/// `waited` is the sleep actually taken between attempts, so it is
/// `(attempts - 1) * wait`: no sleep follows the last attempt.
#[derive(Error, Debug)]
#[error("still locked after {attempts} attempts over {waited:?}: {last}")]
pub struct LockedError {
    pub attempts: u32,
    pub waited: Duration,
    #[source]
    pub last: FsError,
}

#[derive(Error, Debug)]
pub enum TransferError {
    /// Authentication, unreachable server or missing SFTP root.
    #[error("Session to {server} failed: {reason}")]
    Session { server: String, reason: String },

    #[error("Path not found: {}", .0.display())]
    PathNotFound(PathBuf),

    #[error("Duplicate file on destination, overwrite not permitted: {}", .0.display())]
    DuplicateDestination(PathBuf),

    #[error("Resource locked: {0}")]
    Locked(#[from] LockedError),

    #[error("Failed to rename {} to {}: {source}", .from.display(), .to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: FsError,
    },

    #[error("Transfer failed on {}: {source}", .path.display())]
    TransferIo {
        path: PathBuf,
        #[source]
        source: FsError,
    },

    /// The destination already holds the final file.
    #[error("File transferred but source {} could not be removed: {source}", .path.display())]
    SourceNotRemoved {
        path: PathBuf,
        #[source]
        source: FsError,
    },

    #[error("Cleanup of {} failed: {reason}", .path.display())]
    Cleanup { path: PathBuf, reason: String },

    #[error("Operation cancelled")]
    Cancelled,
}

/// Closed classification of [`TransferError`] for consumers of the result stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Session,
    PathNotFound,
    DuplicateDestination,
    Locked,
    Rename,
    TransferIo,
    SourceNotRemoved,
    Cleanup,
    Cancelled,
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Session { .. } => ErrorKind::Session,
            TransferError::PathNotFound(_) => ErrorKind::PathNotFound,
            TransferError::DuplicateDestination(_) => ErrorKind::DuplicateDestination,
            TransferError::Locked(_) => ErrorKind::Locked,
            TransferError::Rename { .. } => ErrorKind::Rename,
            TransferError::TransferIo { .. } => ErrorKind::TransferIo,
            TransferError::SourceNotRemoved { .. } => ErrorKind::SourceNotRemoved,
            TransferError::Cleanup { .. } => ErrorKind::Cleanup,
            TransferError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn session(server: impl Into<String>, reason: impl ToString) -> Self {
        TransferError::Session {
            server: server.into(),
            reason: reason.to_string(),
        }
    }

    pub fn cleanup(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        TransferError::Cleanup {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
