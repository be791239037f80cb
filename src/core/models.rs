use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{ErrorKind, TransferError};
use super::retry::RetryPolicy;

pub const DEFAULT_PARTIAL_SUFFIX: &str = ".filepart";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Local source, remote destination.
    Upload,
    /// Remote source, local destination.
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => f.write_str("upload"),
            Direction::Download => f.write_str("download"),
        }
    }
}

/// One (source, destination) pair and the policy for moving its files.
///
/// Built once by the caller and never changed after dispatch. Results are
/// accumulated separately by the worker that owns the request.
#[derive(Debug, Clone, Serialize)]
pub struct TransferRequest {
    pub id: Uuid,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub direction: Direction,
    /// Lower-case extensions without the leading dot. Empty means every file.
    pub extensions: BTreeSet<String>,
    pub partial_suffix: String,
    pub overwrite_destination: bool,
    pub remove_stale_partials: bool,
    pub error_when_source_missing: bool,
    pub retry_count: u32,
    pub retry_wait: Duration,
}

impl TransferRequest {
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        direction: Direction,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            source: source.into(),
            destination: destination.into(),
            direction,
            extensions: BTreeSet::new(),
            partial_suffix: DEFAULT_PARTIAL_SUFFIX.to_string(),
            overwrite_destination: false,
            remove_stale_partials: false,
            error_when_source_missing: true,
            retry_count: 5,
            retry_wait: Duration::from_secs(2),
        }
    }

    pub fn upload(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self::new(source, destination, Direction::Upload)
    }

    pub fn download(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self::new(source, destination, Direction::Download)
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|e| normalize_extension(e.as_ref()))
            .filter(|e| !e.is_empty())
            .collect();
        self
    }

    pub fn with_partial_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.partial_suffix = suffix.into();
        self
    }

    pub fn overwrite_destination(mut self, overwrite: bool) -> Self {
        self.overwrite_destination = overwrite;
        self
    }

    pub fn remove_stale_partials(mut self, remove: bool) -> Self {
        self.remove_stale_partials = remove;
        self
    }

    pub fn error_when_source_missing(mut self, error: bool) -> Self {
        self.error_when_source_missing = error;
        self
    }

    pub fn with_retry(mut self, count: u32, wait: Duration) -> Self {
        self.retry_count = count;
        self.retry_wait = wait;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_count, self.retry_wait)
    }

    /// Whether a file with this final name passes the extension filter.
    pub fn accepts(&self, file_name: &str) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        let name = file_name.to_lowercase();
        self.extensions.iter().any(|ext| {
            name.strip_suffix(ext.as_str())
                .is_some_and(|stem| stem.len() > 1 && stem.ends_with('.'))
        })
    }

    pub fn partial_name(&self, final_name: &str) -> String {
        format!("{}{}", final_name, self.partial_suffix)
    }

    /// The final name of `file_name` if it carries the partial suffix.
    pub fn strip_partial<'a>(&self, file_name: &'a str) -> Option<&'a str> {
        if self.partial_suffix.is_empty() {
            return None;
        }
        file_name
            .strip_suffix(self.partial_suffix.as_str())
            .filter(|name| !name.is_empty())
    }
}

fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_lowercase()
}

/// A file discovered on either side of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFile {
    pub name: String,
    pub path: PathBuf,
    pub length: u64,
}

/// Steps recorded on a [`TransferResult`], in the order they happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// The file carried the partial suffix when the run started.
    ResumedPartial,
    RemovedDuplicate,
    RemovedStalePartial,
    RenamedSourceToPartial,
    TransferredPartial,
    RenamedDestinationToFinal,
    RemovedSourcePartial,
    /// Rollback after a failed stream put the original source name back.
    RestoredSourceName,
    Uploaded,
    Moved,
    MovedAfterPreviousFailure,
}

impl Action {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Action::Uploaded | Action::Moved | Action::MovedAfterPreviousFailure
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Action::ResumedPartial => "resuming partial file from previous run",
            Action::RemovedDuplicate => "removed duplicate file on destination",
            Action::RemovedStalePartial => "removed partial file left by previous run",
            Action::RenamedSourceToPartial => "renamed source to partial name",
            Action::TransferredPartial => "transferred partial file",
            Action::RenamedDestinationToFinal => "renamed destination to final name",
            Action::RemovedSourcePartial => "removed source partial file",
            Action::RestoredSourceName => "restored original source name",
            Action::Uploaded => "file successfully uploaded",
            Action::Moved => "file moved",
            Action::MovedAfterPreviousFailure => "file moved after previous unsuccessful move",
        };
        f.write_str(text)
    }
}

/// One entry of the result stream. Never changed after it is emitted.
#[derive(Debug, Clone, Serialize)]
pub struct TransferResult {
    pub timestamp: DateTime<Utc>,
    pub request_id: Option<Uuid>,
    pub source: PathBuf,
    pub destination: PathBuf,
    /// `None` for request- and task-level results.
    pub file_name: Option<String>,
    pub file_length: u64,
    pub actions: Vec<Action>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl TransferResult {
    pub fn for_file(request: &TransferRequest, file_name: &str, file_length: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: Some(request.id),
            source: request.source.clone(),
            destination: request.destination.clone(),
            file_name: Some(file_name.to_string()),
            file_length,
            actions: Vec::new(),
            error: None,
            error_kind: None,
        }
    }

    /// A failure that concerns the whole path group rather than one file.
    pub fn for_request(request: &TransferRequest, error: &TransferError) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: Some(request.id),
            source: request.source.clone(),
            destination: request.destination.clone(),
            file_name: None,
            file_length: 0,
            actions: Vec::new(),
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
        }
    }

    /// A session that could not be established; no request was attempted.
    pub fn task_failure(error: &TransferError) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: None,
            source: PathBuf::new(),
            destination: PathBuf::new(),
            file_name: None,
            file_length: 0,
            actions: Vec::new(),
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
        }
    }

    pub fn record(&mut self, action: Action) {
        self.actions.push(action);
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.record(action);
        self
    }

    pub fn failed(mut self, error: &TransferError) -> Self {
        self.timestamp = Utc::now();
        self.error = Some(error.to_string());
        self.error_kind = Some(error.kind());
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_task_level(&self) -> bool {
        self.file_name.is_none()
    }

    pub fn was_resumed(&self) -> bool {
        self.actions.contains(&Action::ResumedPartial)
    }

    pub fn last_action(&self) -> Option<Action> {
        self.actions.last().copied()
    }

    pub fn completed_transfer(&self) -> bool {
        self.is_success() && self.last_action().is_some_and(|a| a.is_terminal())
    }
}

/// Counts handed to whoever reports on a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResultSummary {
    pub transferred: usize,
    pub resumed: usize,
    pub cleanups: usize,
    pub failed: usize,
    pub bytes: u64,
}

impl ResultSummary {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a TransferResult>) -> Self {
        let mut summary = Self::default();
        for result in results {
            if !result.is_success() {
                summary.failed += 1;
            } else if result.completed_transfer() {
                summary.transferred += 1;
                summary.bytes += result.file_length;
                if result.was_resumed() {
                    summary.resumed += 1;
                }
            } else {
                summary.cleanups += 1;
            }
        }
        summary
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_filter_ignores_case_and_dots() {
        let request = TransferRequest::upload("/a", "/b").with_extensions([".CSV", "txt", " "]);
        assert_eq!(request.extensions.len(), 2);
        assert!(request.accepts("report.csv"));
        assert!(request.accepts("NOTES.TXT"));
        assert!(!request.accepts("image.png"));
        assert!(!request.accepts("no_extension"));
        assert!(!request.accepts("reportcsv"));
        assert!(!request.accepts(".csv"));
    }

    #[test]
    fn extension_filter_matches_multi_part_extensions() {
        let request = TransferRequest::upload("/a", "/b").with_extensions(["tar.gz"]);
        assert!(request.accepts("backup.tar.gz"));
        assert!(request.accepts("BACKUP.TAR.GZ"));
        assert!(!request.accepts("backup.gz"));
        assert!(!request.accepts("backup.tgz"));
    }

    #[test]
    fn empty_filter_accepts_everything() {
        let request = TransferRequest::download("/a", "/b");
        assert!(request.accepts("anything.bin"));
        assert!(request.accepts("no_extension"));
    }

    #[test]
    fn partial_names_round_trip() {
        let request = TransferRequest::upload("/a", "/b").with_partial_suffix(".part");
        assert_eq!(request.partial_name("data.csv"), "data.csv.part");
        assert_eq!(request.strip_partial("data.csv.part"), Some("data.csv"));
        assert_eq!(request.strip_partial("data.csv"), None);
        assert_eq!(request.strip_partial(".part"), None);
    }

    #[test]
    fn summary_counts_each_kind_once() {
        let request = TransferRequest::upload("/a", "/b");
        let ok = TransferResult::for_file(&request, "a.txt", 10)
            .with_action(Action::RenamedSourceToPartial)
            .with_action(Action::Uploaded);
        let resumed = TransferResult::for_file(&request, "b.txt", 5)
            .with_action(Action::ResumedPartial)
            .with_action(Action::MovedAfterPreviousFailure);
        let cleanup =
            TransferResult::for_file(&request, "c.txt", 0).with_action(Action::RemovedStalePartial);
        let failed = TransferResult::for_file(&request, "d.txt", 0)
            .failed(&TransferError::DuplicateDestination(PathBuf::from("/b/d.txt")));

        let summary = ResultSummary::from_results([&ok, &resumed, &cleanup, &failed]);
        assert_eq!(
            summary,
            ResultSummary {
                transferred: 2,
                resumed: 1,
                cleanups: 1,
                failed: 1,
                bytes: 15,
            }
        );
        assert!(summary.has_failures());
    }

    #[test]
    fn action_text_distinguishes_resumed_moves() {
        assert_eq!(Action::Moved.to_string(), "file moved");
        assert_eq!(
            Action::MovedAfterPreviousFailure.to_string(),
            "file moved after previous unsuccessful move"
        );
        assert_eq!(Action::Uploaded.to_string(), "file successfully uploaded");
    }
}
