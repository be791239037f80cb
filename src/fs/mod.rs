//! File-system back ends the transfer engine runs on.
//!
//! The engine never talks to `tokio::fs` or an SFTP client directly. Both
//! sides of a transfer are a [`FileSystem`], so an upload and a download run
//! through the same state machine with the two sides swapped.

pub mod local;
pub mod pool;
pub mod sftp;
pub mod simulated;

use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::core::{CandidateFile, TransferError};

pub use local::DiskFs;
pub use pool::{SessionLease, SessionPool};
pub use sftp::SftpConnector;
pub use simulated::{SimulatedConnector, SimulatedFs};

pub type ReadStream = Box<dyn AsyncRead + Send + Unpin>;
pub type WriteStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Failure of a single primitive file-system operation.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("{0} not found")]
    NotFound(String),

    /// Another process holds the entry; worth retrying.
    #[error("{path} is locked: {reason}")]
    Locked { path: String, reason: String },

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("SFTP error on {path}: {reason}")]
    Protocol { path: String, reason: String },
}

impl FsError {
    pub fn is_locked(&self) -> bool {
        matches!(self, FsError::Locked { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }

    /// Classify a local I/O error for `path`.
    pub fn from_io(path: &Path, error: io::Error) -> Self {
        let path = path.display().to_string();
        if error.kind() == io::ErrorKind::NotFound {
            FsError::NotFound(path)
        } else if is_lock_error(&error) {
            FsError::Locked {
                path,
                reason: error.to_string(),
            }
        } else {
            FsError::Io {
                path,
                source: error,
            }
        }
    }
}

/// What a path points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File { length: u64 },
    Directory,
}

/// Primitive operations the engine layers its rename choreography on.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Human-readable name of the side, used in logs.
    fn label(&self) -> &str;

    /// `None` when nothing exists at `path`.
    async fn kind(&self, path: &Path) -> Result<Option<EntryKind>, FsError>;

    /// Regular files directly inside `dir`. Subdirectories are not descended.
    async fn list_files(&self, dir: &Path) -> Result<Vec<CandidateFile>, FsError>;

    async fn open_read(&self, path: &Path) -> Result<ReadStream, FsError>;

    /// Create or truncate `path` for writing.
    async fn create(&self, path: &Path) -> Result<WriteStream, FsError>;

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError>;

    async fn remove(&self, path: &Path) -> Result<(), FsError>;

    /// Release the underlying connection. Errors are ignored.
    async fn close(&self) {}
}

/// Opens authenticated sessions to one server.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Server label used in task-level error messages.
    fn server(&self) -> &str;

    async fn connect(&self) -> Result<Arc<dyn FileSystem>, TransferError>;
}

/// Check if an I/O error means another process holds the file open.
fn is_lock_error(error: &io::Error) -> bool {
    match error.raw_os_error() {
        // ERROR_ACCESS_DENIED, ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
        #[cfg(windows)]
        Some(code) => matches!(code, 5 | 32 | 33),
        #[cfg(unix)]
        Some(code) => matches!(code, libc::EBUSY | libc::ETXTBSY | libc::EAGAIN),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn not_found_is_classified() {
        let err = FsError::from_io(
            &PathBuf::from("/tmp/a"),
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.is_not_found());
        assert!(!err.is_locked());
    }

    #[cfg(unix)]
    #[test]
    fn busy_is_a_lock() {
        let err = FsError::from_io(
            &PathBuf::from("/tmp/a"),
            io::Error::from_raw_os_error(libc::EBUSY),
        );
        assert!(err.is_locked());
    }

    #[test]
    fn error_without_os_code_is_plain_io() {
        let err = FsError::from_io(
            &PathBuf::from("/tmp/a"),
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(matches!(err, FsError::Io { .. }));
    }
}
