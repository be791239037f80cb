//! Per-file transfer state machine.
//!
//! A file moves through these stages, each of which is recorded as an
//! [`Action`] on its result:
//!
//! 1. duplicate check on the destination (refuse, or remove when overwriting)
//! 2. rename the source to its partial name (skipped when resuming)
//! 3. stream the source partial to a destination partial
//! 4. rename the destination partial to the final name
//! 5. remove the source partial
//!
//! Until stage 4 completes the destination only ever holds a partial-named
//! file, and the source keeps the data until stage 5, so a crash at any point
//! leaves something a later run can resume or discard.
//!
//! Upload and download are the same machine with the local and remote
//! [`FileSystem`]s swapped; only the terminal action differs.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::error::TransferError;
use super::models::{Action, CandidateFile, Direction, TransferRequest, TransferResult};
use super::retry::{RetryError, Sleeper, TokioSleeper, retry};
use crate::fs::{EntryKind, FileSystem, FsError};

/// Everything one file transfer needs, borrowed from its path group.
pub struct FileTransfer<'a> {
    pub request: &'a TransferRequest,
    pub source_fs: &'a dyn FileSystem,
    pub destination_fs: &'a dyn FileSystem,
    /// Directory the candidate was found in.
    pub source_dir: &'a Path,
    pub file: &'a CandidateFile,
}

/// Names and paths a single file goes through.
struct TransferPlan {
    final_name: String,
    resumed: bool,
    source_original: PathBuf,
    source_partial: PathBuf,
    destination_final: PathBuf,
    destination_partial: PathBuf,
}

impl TransferPlan {
    fn new(job: &FileTransfer<'_>) -> Self {
        let request = job.request;
        let (final_name, resumed) = match request.strip_partial(&job.file.name) {
            Some(stripped) => (stripped.to_string(), true),
            None => (job.file.name.clone(), false),
        };
        let partial_name = request.partial_name(&final_name);

        Self {
            source_original: job.file.path.clone(),
            source_partial: job.source_dir.join(&partial_name),
            destination_final: request.destination.join(&final_name),
            destination_partial: request.destination.join(&partial_name),
            final_name,
            resumed,
        }
    }
}

#[derive(Clone)]
pub struct TransferEngine {
    sleeper: Arc<dyn Sleeper>,
    cancel: CancellationToken,
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self::new(Arc::new(TokioSleeper), CancellationToken::new())
    }
}

impl TransferEngine {
    pub fn new(sleeper: Arc<dyn Sleeper>, cancel: CancellationToken) -> Self {
        Self { sleeper, cancel }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Retry a rename or removal while it fails on a lock.
    pub async fn with_retry<F, Fut>(
        &self,
        request: &TransferRequest,
        operation: F,
    ) -> Result<(), RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), FsError>>,
    {
        retry(
            &request.retry_policy(),
            self.sleeper.as_ref(),
            &self.cancel,
            operation,
        )
        .await
    }

    /// Move one file, appending its result (and any side results such as a
    /// removed duplicate or a failed rollback) to `log`.
    pub async fn transfer(&self, job: FileTransfer<'_>, log: &mut Vec<TransferResult>) {
        let plan = TransferPlan::new(&job);
        let span = info_span!(
            "file_transfer",
            file = %plan.final_name,
            resumed = plan.resumed
        );

        async {
            let mut result =
                TransferResult::for_file(job.request, &plan.final_name, job.file.length);
            if plan.resumed {
                info!("Resuming partial file from a previous run");
                result.record(Action::ResumedPartial);
            }

            match self.run_stages(&job, &plan, &mut result, log).await {
                Ok(()) => {
                    info!(actions = ?result.actions, "Transfer complete");
                    log.push(result);
                }
                Err(e) => {
                    warn!(error = %e, "Transfer failed");
                    log.push(result.failed(&e));
                }
            }
        }
        .instrument(span)
        .await;
    }

    async fn run_stages(
        &self,
        job: &FileTransfer<'_>,
        plan: &TransferPlan,
        result: &mut TransferResult,
        log: &mut Vec<TransferResult>,
    ) -> Result<(), TransferError> {
        let request = job.request;
        let source_fs = job.source_fs;
        let destination_fs = job.destination_fs;

        self.clear_duplicate(job, plan, log).await?;

        if !plan.resumed {
            debug!(stage = "rename_source_to_partial", from = %plan.source_original.display());
            self.with_retry(request, || {
                source_fs.rename(&plan.source_original, &plan.source_partial)
            })
            .await
            .map_err(|e| {
                e.into_transfer_error(|source| TransferError::Rename {
                    from: plan.source_original.clone(),
                    to: plan.source_partial.clone(),
                    source,
                })
            })?;
            result.record(Action::RenamedSourceToPartial);
        }

        debug!(stage = "transfer_partial", to = %plan.destination_partial.display());
        match self
            .stream(
                source_fs,
                &plan.source_partial,
                destination_fs,
                &plan.destination_partial,
            )
            .await
        {
            Ok(bytes) => {
                result.file_length = bytes;
                result.record(Action::TransferredPartial);
            }
            Err(e) => {
                discard_partial(destination_fs, &plan.destination_partial).await;
                if !plan.resumed {
                    self.restore_source_name(job, plan, result, log).await;
                }
                return Err(e);
            }
        }

        debug!(stage = "rename_destination_to_final", to = %plan.destination_final.display());
        self.with_retry(request, || {
            destination_fs.rename(&plan.destination_partial, &plan.destination_final)
        })
        .await
        .map_err(|e| {
            e.into_transfer_error(|source| TransferError::Rename {
                from: plan.destination_partial.clone(),
                to: plan.destination_final.clone(),
                source,
            })
        })?;
        result.record(Action::RenamedDestinationToFinal);

        debug!(stage = "remove_source_partial", path = %plan.source_partial.display());
        source_fs
            .remove(&plan.source_partial)
            .await
            .map_err(|source| TransferError::SourceNotRemoved {
                path: plan.source_partial.clone(),
                source,
            })?;
        result.record(Action::RemovedSourcePartial);

        result.record(match (request.direction, plan.resumed) {
            (Direction::Upload, _) => Action::Uploaded,
            (Direction::Download, false) => Action::Moved,
            (Direction::Download, true) => Action::MovedAfterPreviousFailure,
        });
        Ok(())
    }

    /// Refuse or remove a file already holding the final name on the destination.
    async fn clear_duplicate(
        &self,
        job: &FileTransfer<'_>,
        plan: &TransferPlan,
        log: &mut Vec<TransferResult>,
    ) -> Result<(), TransferError> {
        let request = job.request;
        let destination_fs = job.destination_fs;

        let existing = destination_fs
            .kind(&plan.destination_final)
            .await
            .map_err(|source| TransferError::TransferIo {
                path: plan.destination_final.clone(),
                source,
            })?;
        let Some(existing) = existing else {
            return Ok(());
        };

        if !request.overwrite_destination {
            return Err(TransferError::DuplicateDestination(
                plan.destination_final.clone(),
            ));
        }

        match self
            .with_retry(request, || destination_fs.remove(&plan.destination_final))
            .await
        {
            Ok(()) => {
                info!(path = %plan.destination_final.display(), "Removed duplicate on destination");
                let length = match existing {
                    EntryKind::File { length } => length,
                    EntryKind::Directory => 0,
                };
                log.push(
                    TransferResult::for_file(request, &plan.final_name, length)
                        .with_action(Action::RemovedDuplicate),
                );
                Ok(())
            }
            Err(RetryError::Cancelled) => Err(TransferError::Cancelled),
            // Reported on the file's own result; the source stays untouched.
            Err(e) => Err(TransferError::cleanup(&plan.destination_final, e)),
        }
    }

    /// Put the original source name back after a failed stream. A failure
    /// here is reported as its own result.
    async fn restore_source_name(
        &self,
        job: &FileTransfer<'_>,
        plan: &TransferPlan,
        result: &mut TransferResult,
        log: &mut Vec<TransferResult>,
    ) {
        let source_fs = job.source_fs;
        // A cancelled run still gets one rollback attempt.
        let restored = if self.cancel.is_cancelled() {
            source_fs
                .rename(&plan.source_partial, &plan.source_original)
                .await
                .map_err(|e| e.to_string())
        } else {
            self.with_retry(job.request, || {
                source_fs.rename(&plan.source_partial, &plan.source_original)
            })
            .await
            .map_err(|e| e.to_string())
        };

        match restored {
            Ok(()) => result.record(Action::RestoredSourceName),
            Err(reason) => {
                let error = TransferError::cleanup(&plan.source_partial, reason);
                warn!(error = %error, "Could not restore original source name");
                log.push(
                    TransferResult::for_file(job.request, &plan.final_name, job.file.length)
                        .failed(&error),
                );
            }
        }
    }

    /// Copy `from` on one side to `to` on the other, returning the byte count.
    async fn stream(
        &self,
        from_fs: &dyn FileSystem,
        from: &Path,
        to_fs: &dyn FileSystem,
        to: &Path,
    ) -> Result<u64, TransferError> {
        let read_error = |source| TransferError::TransferIo {
            path: from.to_path_buf(),
            source,
        };
        let write_error = |source| TransferError::TransferIo {
            path: to.to_path_buf(),
            source,
        };

        let mut reader = from_fs.open_read(from).await.map_err(read_error)?;
        let mut writer = to_fs.create(to).await.map_err(write_error)?;

        let bytes = tokio::select! {
            copied = tokio::io::copy(&mut reader, &mut writer) => {
                copied.map_err(|e| write_error(FsError::from_io(to, e)))?
            }
            _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
        };

        writer
            .shutdown()
            .await
            .map_err(|e| write_error(FsError::from_io(to, e)))?;

        debug!(bytes, from = %from.display(), to = %to.display(), "Stream complete");
        Ok(bytes)
    }
}

/// Best-effort removal of a half-written destination partial. The source
/// still holds the data, so a leftover is only noise for the next run.
async fn discard_partial(fs: &dyn FileSystem, path: &Path) {
    match fs.remove(path).await {
        Ok(()) => debug!(path = %path.display(), "Discarded incomplete destination partial"),
        Err(e) if e.is_not_found() => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Could not discard destination partial"),
    }
}
