//! In-memory file system and connector for tests.
//!
//! Clones of a [`SimulatedFs`] share one tree, so a test keeps a handle to
//! inspect the files while the engine works on another. Failures are injected
//! per path: a lock makes renames and removals fail with [`FsError::Locked`]
//! a set number of times, and write or rename failures are permanent.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use super::{Connector, EntryKind, FileSystem, FsError, ReadStream, WriteStream};
use crate::core::{CandidateFile, TransferError};

enum Node {
    Dir,
    File(Vec<u8>),
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<PathBuf, Node>,
    locks: HashMap<PathBuf, u32>,
    failing_writes: HashSet<PathBuf>,
    failing_renames: HashSet<PathBuf>,
    renames: usize,
    closes: usize,
}

impl State {
    fn is_dir(&self, path: &Path) -> bool {
        path.parent().is_none() || matches!(self.nodes.get(path), Some(Node::Dir))
    }

    fn add_dir_all(&mut self, path: &Path) {
        for ancestor in path.ancestors() {
            if ancestor.parent().is_none() {
                break;
            }
            self.nodes.insert(ancestor.to_path_buf(), Node::Dir);
        }
    }

    /// Consume one pending lock failure on `path`, if any.
    fn take_lock(&mut self, path: &Path) -> Result<(), FsError> {
        match self.locks.get_mut(path) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(FsError::Locked {
                    path: path.display().to_string(),
                    reason: "simulated lock".to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct SimulatedFs {
    label: String,
    latency: Option<Duration>,
    state: Arc<Mutex<State>>,
}

impl Default for SimulatedFs {
    fn default() -> Self {
        Self::named("simulated")
    }
}

impl SimulatedFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            latency: None,
            state: Arc::default(),
        }
    }

    /// Delay listings and file creation so concurrent workers overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    pub fn add_dir(&self, path: impl AsRef<Path>) {
        self.state().add_dir_all(path.as_ref());
    }

    /// Add a file, creating its parent directories.
    pub fn add_file(&self, path: impl AsRef<Path>, data: &[u8]) {
        let path = path.as_ref();
        let mut state = self.state();
        if let Some(parent) = path.parent() {
            state.add_dir_all(parent);
        }
        state
            .nodes
            .insert(path.to_path_buf(), Node::File(data.to_vec()));
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.state().nodes.contains_key(path.as_ref())
    }

    pub fn read(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        match self.state().nodes.get(path.as_ref()) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    /// Names of the files directly inside `dir`, sorted.
    pub fn files_in(&self, dir: impl AsRef<Path>) -> Vec<String> {
        let dir = dir.as_ref();
        self.state()
            .nodes
            .iter()
            .filter(|(path, node)| matches!(node, Node::File(_)) && path.parent() == Some(dir))
            .filter_map(|(path, _)| path.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect()
    }

    /// Make the next `times` renames or removals of `path` fail as locked.
    pub fn lock(&self, path: impl AsRef<Path>, times: u32) {
        self.state().locks.insert(path.as_ref().to_path_buf(), times);
    }

    /// Every write to `path` fails.
    pub fn fail_writes(&self, path: impl AsRef<Path>) {
        self.state()
            .failing_writes
            .insert(path.as_ref().to_path_buf());
    }

    /// Every rename of `path` fails with an error that is not a lock.
    pub fn fail_renames(&self, path: impl AsRef<Path>) {
        self.state()
            .failing_renames
            .insert(path.as_ref().to_path_buf());
    }

    /// Rename attempts, failed ones included.
    pub fn rename_calls(&self) -> usize {
        self.state().renames
    }

    pub fn close_calls(&self) -> usize {
        self.state().closes
    }
}

#[async_trait]
impl FileSystem for SimulatedFs {
    fn label(&self) -> &str {
        &self.label
    }

    async fn kind(&self, path: &Path) -> Result<Option<EntryKind>, FsError> {
        let state = self.state();
        if state.is_dir(path) {
            return Ok(Some(EntryKind::Directory));
        }
        Ok(match state.nodes.get(path) {
            Some(Node::File(data)) => Some(EntryKind::File {
                length: data.len() as u64,
            }),
            _ => None,
        })
    }

    async fn list_files(&self, dir: &Path) -> Result<Vec<CandidateFile>, FsError> {
        self.pause().await;
        let state = self.state();
        if !state.is_dir(dir) {
            return Err(FsError::NotFound(dir.display().to_string()));
        }

        Ok(state
            .nodes
            .iter()
            .filter(|(path, _)| path.parent() == Some(dir))
            .filter_map(|(path, node)| match node {
                Node::File(data) => Some(CandidateFile {
                    name: path.file_name()?.to_string_lossy().into_owned(),
                    path: path.clone(),
                    length: data.len() as u64,
                }),
                Node::Dir => None,
            })
            .collect())
    }

    async fn open_read(&self, path: &Path) -> Result<ReadStream, FsError> {
        match self.state().nodes.get(path) {
            Some(Node::File(data)) => Ok(Box::new(io::Cursor::new(data.clone()))),
            _ => Err(FsError::NotFound(path.display().to_string())),
        }
    }

    async fn create(&self, path: &Path) -> Result<WriteStream, FsError> {
        self.pause().await;
        let mut state = self.state();
        let parent_exists = path.parent().is_some_and(|parent| state.is_dir(parent));
        if !parent_exists {
            return Err(FsError::NotFound(path.display().to_string()));
        }

        state
            .nodes
            .insert(path.to_path_buf(), Node::File(Vec::new()));
        Ok(Box::new(SimulatedWriter {
            state: Arc::clone(&self.state),
            path: path.to_path_buf(),
            fail: state.failing_writes.contains(path),
        }))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        let mut state = self.state();
        state.renames += 1;
        state.take_lock(from)?;

        if state.failing_renames.contains(from) {
            return Err(FsError::Io {
                path: from.display().to_string(),
                source: io::Error::new(io::ErrorKind::PermissionDenied, "simulated rename failure"),
            });
        }
        if !to.parent().is_some_and(|parent| state.is_dir(parent)) {
            return Err(FsError::NotFound(to.display().to_string()));
        }

        let node = state
            .nodes
            .remove(from)
            .ok_or_else(|| FsError::NotFound(from.display().to_string()))?;
        state.nodes.insert(to.to_path_buf(), node);
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<(), FsError> {
        let mut state = self.state();
        state.take_lock(path)?;
        match state.nodes.get(path) {
            Some(Node::File(_)) => {
                state.nodes.remove(path);
                Ok(())
            }
            Some(Node::Dir) => Err(FsError::Io {
                path: path.display().to_string(),
                source: io::Error::other("is a directory"),
            }),
            None => Err(FsError::NotFound(path.display().to_string())),
        }
    }

    async fn close(&self) {
        self.state().closes += 1;
    }
}

/// Appends straight into the shared tree.
struct SimulatedWriter {
    state: Arc<Mutex<State>>,
    path: PathBuf,
    fail: bool,
}

impl AsyncWrite for SimulatedWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.fail {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated write failure",
            )));
        }

        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match state.nodes.get_mut(&self.path) {
            Some(Node::File(data)) => {
                data.extend_from_slice(buf);
                Poll::Ready(Ok(buf.len()))
            }
            _ => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotFound,
                "file removed while writing",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Hands out sessions onto one shared [`SimulatedFs`].
pub struct SimulatedConnector {
    server: String,
    fs: SimulatedFs,
    reject_auth: bool,
    missing_root: bool,
    connections: AtomicUsize,
}

impl SimulatedConnector {
    pub fn new(server: impl Into<String>, fs: SimulatedFs) -> Self {
        Self {
            server: server.into(),
            fs,
            reject_auth: false,
            missing_root: false,
            connections: AtomicUsize::new(0),
        }
    }

    /// Fail every connection as if the credentials were wrong.
    pub fn reject_auth(mut self) -> Self {
        self.reject_auth = true;
        self
    }

    /// Fail every connection as if the configured root did not exist.
    pub fn missing_root(mut self) -> Self {
        self.missing_root = true;
        self
    }

    /// Sessions successfully opened so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    fn server(&self) -> &str {
        &self.server
    }

    async fn connect(&self) -> Result<Arc<dyn FileSystem>, TransferError> {
        if self.reject_auth {
            return Err(TransferError::session(&self.server, "authentication rejected"));
        }
        if self.missing_root {
            return Err(TransferError::session(&self.server, "root directory does not exist"));
        }
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.fs.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn clones_share_one_tree() {
        let fs = SimulatedFs::new();
        let handle = fs.clone();
        fs.add_file("/data/a.txt", b"hello");

        assert!(handle.contains("/data"));
        assert_eq!(
            handle.kind(Path::new("/data")).await.unwrap(),
            Some(EntryKind::Directory)
        );
        assert_eq!(handle.files_in("/data"), vec!["a.txt"]);
    }

    #[tokio::test]
    async fn written_bytes_land_in_the_tree() {
        let fs = SimulatedFs::new();
        fs.add_dir("/data");

        let mut writer = fs.create(Path::new("/data/b.txt")).await.unwrap();
        writer.write_all(b"payload").await.unwrap();
        writer.shutdown().await.unwrap();

        let mut reader = fs.open_read(Path::new("/data/b.txt")).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"payload");
    }

    #[tokio::test]
    async fn lock_expires_after_the_given_failures() {
        let fs = SimulatedFs::new();
        fs.add_file("/data/a.txt", b"x");
        fs.lock("/data/a.txt", 2);

        let from = Path::new("/data/a.txt");
        let to = Path::new("/data/b.txt");
        assert!(fs.rename(from, to).await.unwrap_err().is_locked());
        assert!(fs.rename(from, to).await.unwrap_err().is_locked());
        fs.rename(from, to).await.unwrap();

        assert_eq!(fs.rename_calls(), 3);
        assert!(fs.contains(to));
    }

    #[tokio::test]
    async fn create_needs_an_existing_parent() {
        let fs = SimulatedFs::new();
        let err = fs.create(Path::new("/nowhere/a.txt")).await.err().unwrap();
        assert!(err.is_not_found());
    }
}
