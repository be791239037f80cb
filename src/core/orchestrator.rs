//! Runs a task's path groups against one server.
//!
//! A task opens a [`SessionPool`]; if that fails the whole task reports a
//! single session failure. Otherwise each request is handed to a worker that
//! leases its own session, with at most `max_concurrency` workers at once.
//! Results stream out over a channel as each group finishes; a group's own
//! results stay in the order its files were handled.

use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::error::TransferError;
use super::models::{TransferRequest, TransferResult};
use super::path_group::PathGroupProcessor;
use super::progress::ProgressTracker;
use super::retry::{Sleeper, TokioSleeper};
use super::transfer_engine::TransferEngine;
use crate::fs::{Connector, FileSystem, SessionPool};

const RESULT_BUFFER: usize = 64;

#[derive(Clone)]
pub struct Orchestrator {
    local: Arc<dyn FileSystem>,
    engine: TransferEngine,
    progress: ProgressTracker,
}

impl Orchestrator {
    pub fn new(local: Arc<dyn FileSystem>, cancel: CancellationToken) -> Self {
        Self::with_sleeper(local, Arc::new(TokioSleeper), cancel)
    }

    pub fn with_sleeper(
        local: Arc<dyn FileSystem>,
        sleeper: Arc<dyn Sleeper>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            local,
            engine: TransferEngine::new(sleeper, cancel),
            progress: ProgressTracker::new(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressTracker) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn cancellation(&self) -> &CancellationToken {
        self.engine.cancellation()
    }

    /// Start processing `requests` in the background. The receiver yields
    /// every result and closes once all workers are done and the sessions
    /// are closed.
    pub fn run(
        &self,
        connector: Arc<dyn Connector>,
        requests: Vec<TransferRequest>,
        max_concurrency: usize,
    ) -> mpsc::Receiver<TransferResult> {
        let (tx, rx) = mpsc::channel(RESULT_BUFFER);
        let this = self.clone();
        let span = info_span!("task", server = connector.server(), requests = requests.len());

        tokio::spawn(
            async move {
                this.execute(connector, requests, max_concurrency.max(1), tx)
                    .await;
            }
            .instrument(span),
        );
        rx
    }

    /// Like [`Orchestrator::run`], collecting everything into one list.
    pub async fn run_to_end(
        &self,
        connector: Arc<dyn Connector>,
        requests: Vec<TransferRequest>,
        max_concurrency: usize,
    ) -> Vec<TransferResult> {
        let mut rx = self.run(connector, requests, max_concurrency);
        let mut results = Vec::new();
        while let Some(result) = rx.recv().await {
            results.push(result);
        }
        results
    }

    async fn execute(
        &self,
        connector: Arc<dyn Connector>,
        requests: Vec<TransferRequest>,
        max_concurrency: usize,
        tx: mpsc::Sender<TransferResult>,
    ) {
        let pool = match SessionPool::open(connector, max_concurrency).await {
            Ok(pool) => pool,
            Err(e) => {
                error!(error = %e, "Could not open session, task aborted");
                let _ = tx.send(TransferResult::task_failure(&e)).await;
                return;
            }
        };

        if max_concurrency == 1 {
            self.run_sequential(&pool, requests, &tx).await;
        } else {
            self.run_concurrent(&pool, requests, max_concurrency, &tx)
                .await;
        }

        pool.close().await;
        let peak = self.progress.peak().await;
        info!(peak, "Task finished");
    }

    async fn run_sequential(
        &self,
        pool: &Arc<SessionPool>,
        requests: Vec<TransferRequest>,
        tx: &mpsc::Sender<TransferResult>,
    ) {
        for request in requests {
            let results = if self.cancellation().is_cancelled() {
                vec![cancelled(&request)]
            } else {
                self.process(pool, &request).await
            };
            if !forward(tx, results).await {
                return;
            }
        }
    }

    async fn run_concurrent(
        &self,
        pool: &Arc<SessionPool>,
        requests: Vec<TransferRequest>,
        max_concurrency: usize,
        tx: &mpsc::Sender<TransferResult>,
    ) {
        let semaphore = Arc::new(Semaphore::new(max_concurrency));
        let mut workers = JoinSet::new();
        let mut pending = requests.into_iter();

        while let Some(request) = pending.next() {
            let permit = tokio::select! {
                biased;
                _ = self.cancellation().cancelled() => {
                    // Groups never started are still reported.
                    for request in std::iter::once(request).chain(pending.by_ref()) {
                        let _ = tx.send(cancelled(&request)).await;
                    }
                    break;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => permit,
            };
            let Ok(permit) = permit else { break };

            let this = self.clone();
            let pool = Arc::clone(pool);
            let tx = tx.clone();
            workers.spawn(async move {
                let results = this.process(&pool, &request).await;
                forward(&tx, results).await;
                drop(permit);
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Path group worker panicked");
            }
        }
    }

    /// One path group on a leased session.
    async fn process(
        &self,
        pool: &Arc<SessionPool>,
        request: &TransferRequest,
    ) -> Vec<TransferResult> {
        let session = match pool.acquire().await {
            Ok(session) => session,
            Err(e) => {
                warn!(request = %request.id, error = %e, "No session for path group");
                return vec![TransferResult::for_request(request, &e)];
            }
        };

        self.progress.start(request).await;
        let active = self.progress.active_count().await;
        debug!(request = %request.id, active, "Path group started");

        let results = PathGroupProcessor::new(self.local.as_ref(), &*session, &self.engine)
            .with_progress(&self.progress)
            .process(request)
            .await;

        self.progress.finish(request.id).await;
        results
    }
}

fn cancelled(request: &TransferRequest) -> TransferResult {
    TransferResult::for_request(request, &TransferError::Cancelled)
}

/// Send a group's results in order. False once the receiver is gone.
async fn forward(tx: &mpsc::Sender<TransferResult>, results: Vec<TransferResult>) -> bool {
    for result in results {
        if tx.send(result).await.is_err() {
            debug!("Result receiver dropped");
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use crate::core::models::Action;
    use crate::core::retry::RecordingSleeper;
    use crate::fs::{SimulatedConnector, SimulatedFs};
    use std::time::Duration;

    fn orchestrator(local: &SimulatedFs, cancel: CancellationToken) -> Orchestrator {
        Orchestrator::with_sleeper(
            Arc::new(local.clone()),
            Arc::new(RecordingSleeper::new()),
            cancel,
        )
    }

    #[tokio::test]
    async fn session_failure_is_one_task_level_result() {
        let local = SimulatedFs::named("local");
        local.add_file("/out/a/1.csv", b"1");
        local.add_file("/out/b/2.csv", b"2");
        let connector = Arc::new(
            SimulatedConnector::new("mover@sftp.test:22", SimulatedFs::new()).reject_auth(),
        );

        let requests = vec![
            TransferRequest::upload("/out/a", "/in"),
            TransferRequest::upload("/out/b", "/in"),
        ];
        let results = orchestrator(&local, CancellationToken::new())
            .run_to_end(connector, requests, 4)
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].error_kind, Some(ErrorKind::Session));
        assert!(results[0].request_id.is_none());
        assert!(results[0].error.as_deref().unwrap().contains("mover@sftp.test:22"));
        assert!(local.contains("/out/a/1.csv"));
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_the_limit() {
        let local = SimulatedFs::named("local").with_latency(Duration::from_millis(5));
        let remote = SimulatedFs::named("remote");
        let mut requests = Vec::new();
        for group in 0..6 {
            local.add_file(format!("/out/{group}/f.csv"), b"data");
            remote.add_dir(format!("/in/{group}"));
            requests.push(TransferRequest::upload(
                format!("/out/{group}"),
                format!("/in/{group}"),
            ));
        }
        let connector = Arc::new(SimulatedConnector::new("sftp.test:22", remote.clone()));

        let orchestrator = orchestrator(&local, CancellationToken::new());
        let results = orchestrator.run_to_end(connector.clone(), requests, 2).await;

        assert_eq!(results.len(), 6);
        assert!(results.iter().all(|r| r.last_action() == Some(Action::Uploaded)));
        let peak = orchestrator.progress().peak().await;
        assert!((1..=2).contains(&peak), "peak was {peak}");
        assert!(connector.connections() <= 2);
        assert_eq!(remote.close_calls(), connector.connections());
    }

    #[tokio::test]
    async fn sequential_run_keeps_request_order() {
        let local = SimulatedFs::named("local");
        let remote = SimulatedFs::named("remote");
        remote.add_dir("/in");
        local.add_file("/out/a/1.csv", b"1");
        local.add_file("/out/b/2.csv", b"2");
        let connector = Arc::new(SimulatedConnector::new("sftp.test:22", remote));

        let requests = vec![
            TransferRequest::upload("/out/b", "/in"),
            TransferRequest::upload("/out/a", "/in"),
        ];
        let results = orchestrator(&local, CancellationToken::new())
            .run_to_end(connector, requests, 1)
            .await;

        let names: Vec<_> = results.iter().filter_map(|r| r.file_name.clone()).collect();
        assert_eq!(names, vec!["2.csv", "1.csv"]);
    }

    #[tokio::test]
    async fn cancelled_run_reports_every_group() {
        let local = SimulatedFs::named("local");
        let remote = SimulatedFs::named("remote");
        remote.add_dir("/in");
        local.add_file("/out/a/1.csv", b"1");
        local.add_file("/out/b/2.csv", b"2");
        let connector = Arc::new(SimulatedConnector::new("sftp.test:22", remote.clone()));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let requests = vec![
            TransferRequest::upload("/out/a", "/in"),
            TransferRequest::upload("/out/b", "/in"),
        ];
        let results = orchestrator(&local, cancel).run_to_end(connector, requests, 3).await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.error_kind == Some(ErrorKind::Cancelled)));
        assert!(remote.files_in("/in").is_empty());
        assert!(local.contains("/out/a/1.csv"));
    }
}
