//! Path-group processing: everything that happens for one [`TransferRequest`].
//!
//! Resolves the files to move (directory listing or a single named file),
//! removes stale partials left on the destination by an earlier crash, and
//! drives the [`TransferEngine`] once per file in a fixed order.

use std::path::{Path, PathBuf};

use tracing::{Instrument, debug, info, info_span, warn};

use super::error::TransferError;
use super::models::{Action, CandidateFile, Direction, TransferRequest, TransferResult};
use super::progress::ProgressTracker;
use super::retry::RetryError;
use super::transfer_engine::{FileTransfer, TransferEngine};
use crate::fs::{EntryKind, FileSystem};

pub struct PathGroupProcessor<'a> {
    local: &'a dyn FileSystem,
    remote: &'a dyn FileSystem,
    engine: &'a TransferEngine,
    progress: Option<&'a ProgressTracker>,
}

impl<'a> PathGroupProcessor<'a> {
    pub fn new(
        local: &'a dyn FileSystem,
        remote: &'a dyn FileSystem,
        engine: &'a TransferEngine,
    ) -> Self {
        Self {
            local,
            remote,
            engine,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: &'a ProgressTracker) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Process every file of `request`. The returned results are in the order
    /// the files were handled.
    pub async fn process(&self, request: &TransferRequest) -> Vec<TransferResult> {
        let span = info_span!(
            "path_group",
            request = %request.id,
            direction = %request.direction,
            source = %request.source.display(),
            destination = %request.destination.display()
        );

        async {
            let mut log = Vec::new();
            if let Err(e) = self.run(request, &mut log).await {
                warn!(error = %e, "Path group failed");
                log.push(TransferResult::for_request(request, &e));
            }
            info!(results = log.len(), "Path group finished");
            log
        }
        .instrument(span)
        .await
    }

    fn sides(&self, direction: Direction) -> (&'a dyn FileSystem, &'a dyn FileSystem) {
        match direction {
            Direction::Upload => (self.local, self.remote),
            Direction::Download => (self.remote, self.local),
        }
    }

    async fn run(
        &self,
        request: &TransferRequest,
        log: &mut Vec<TransferResult>,
    ) -> Result<(), TransferError> {
        let (source_fs, destination_fs) = self.sides(request.direction);

        let source_kind = source_fs
            .kind(&request.source)
            .await
            .map_err(|source| TransferError::TransferIo {
                path: request.source.clone(),
                source,
            })?;
        let Some(source_kind) = source_kind else {
            if request.error_when_source_missing {
                return Err(TransferError::PathNotFound(request.source.clone()));
            }
            debug!(side = source_fs.label(), "Source missing, nothing to do");
            return Ok(());
        };

        // A missing destination is never created.
        match destination_fs.kind(&request.destination).await {
            Ok(Some(EntryKind::Directory)) => {}
            Ok(_) => return Err(TransferError::PathNotFound(request.destination.clone())),
            Err(source) => {
                return Err(TransferError::TransferIo {
                    path: request.destination.clone(),
                    source,
                });
            }
        }

        if request.remove_stale_partials {
            self.remove_stale_partials(destination_fs, request, log)
                .await?;
        }

        let (source_dir, candidates) =
            self.discover(source_fs, request, source_kind).await?;
        info!(
            side = source_fs.label(),
            candidates = candidates.len(),
            "Discovered files"
        );

        for file in &candidates {
            if self.engine.cancellation().is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            if let Some(progress) = self.progress {
                progress.set_current_file(request.id, &file.name).await;
            }

            let job = FileTransfer {
                request,
                source_fs,
                destination_fs,
                source_dir: &source_dir,
                file,
            };
            self.engine.transfer(job, log).await;
        }

        Ok(())
    }

    /// Files to move, in processing order: resumable partials first, then by name.
    async fn discover(
        &self,
        source_fs: &dyn FileSystem,
        request: &TransferRequest,
        source_kind: EntryKind,
    ) -> Result<(PathBuf, Vec<CandidateFile>), TransferError> {
        let (source_dir, mut files) = match source_kind {
            EntryKind::Directory => {
                let files = source_fs.list_files(&request.source).await.map_err(|source| {
                    TransferError::TransferIo {
                        path: request.source.clone(),
                        source,
                    }
                })?;
                (request.source.clone(), files)
            }
            EntryKind::File { length } => {
                let name = file_name(&request.source);
                let dir = request
                    .source
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                let file = CandidateFile {
                    name,
                    path: request.source.clone(),
                    length,
                };
                (dir, vec![file])
            }
        };

        files.retain(|file| {
            let final_name = request.strip_partial(&file.name).unwrap_or(&file.name);
            request.accepts(final_name)
        });
        files.sort_by(|a, b| {
            let a_fresh = request.strip_partial(&a.name).is_none();
            let b_fresh = request.strip_partial(&b.name).is_none();
            a_fresh.cmp(&b_fresh).then_with(|| a.name.cmp(&b.name))
        });

        Ok((source_dir, files))
    }

    /// Delete partial files a crashed run left half-written on the destination.
    async fn remove_stale_partials(
        &self,
        destination_fs: &dyn FileSystem,
        request: &TransferRequest,
        log: &mut Vec<TransferResult>,
    ) -> Result<(), TransferError> {
        let entries = destination_fs
            .list_files(&request.destination)
            .await
            .map_err(|source| TransferError::TransferIo {
                path: request.destination.clone(),
                source,
            })?;

        for entry in entries {
            let Some(final_name) = request.strip_partial(&entry.name) else {
                continue;
            };
            if !request.accepts(final_name) {
                continue;
            }

            let result = TransferResult::for_file(request, &entry.name, entry.length);
            match self
                .engine
                .with_retry(request, || destination_fs.remove(&entry.path))
                .await
            {
                Ok(()) => {
                    info!(path = %entry.path.display(), "Removed stale partial file");
                    log.push(result.with_action(Action::RemovedStalePartial));
                }
                Err(RetryError::Cancelled) => return Err(TransferError::Cancelled),
                Err(e) => {
                    let error = TransferError::cleanup(&entry.path, e);
                    warn!(error = %error, "Could not remove stale partial file");
                    log.push(result.failed(&error));
                }
            }
        }

        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
