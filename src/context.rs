use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::config::{AppConfig, TaskConfig};
use crate::core::{Orchestrator, ProgressTracker, TransferError, TransferResult};
use crate::fs::{Connector, DiskFs};

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub cancel: CancellationToken,
    pub progress: ProgressTracker,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            cancel: CancellationToken::new(),
            progress: ProgressTracker::new(),
        }
    }

    /// An orchestrator on the local disk sharing this context's cancellation
    /// and progress.
    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(Arc::new(DiskFs::new()), self.cancel.clone())
            .with_progress(self.progress.clone())
    }

    /// Run `tasks` one after another, handing every result to `emit` as it
    /// arrives. A task whose connector cannot be built yields one task-level
    /// session result and the following tasks still run.
    pub async fn run_tasks<C, E>(
        &self,
        tasks: &[&TaskConfig],
        max_concurrency: Option<usize>,
        connect: C,
        mut emit: E,
    ) -> Result<Vec<TransferResult>>
    where
        C: Fn(&TaskConfig) -> Result<Arc<dyn Connector>>,
        E: FnMut(&TransferResult) -> Result<()>,
    {
        let mut results = Vec::new();
        for &task in tasks {
            if self.cancel.is_cancelled() {
                warn!(task = %task.name, "Skipping task after cancellation");
                break;
            }

            let connector = match connect(task) {
                Ok(connector) => connector,
                Err(e) => {
                    let failure = TransferError::session(task.server.server(), format!("{e:#}"));
                    error!(task = %task.name, error = %failure, "Cannot set up session");
                    let result = TransferResult::task_failure(&failure);
                    emit(&result)?;
                    results.push(result);
                    continue;
                }
            };

            let concurrency = max_concurrency
                .unwrap_or_else(|| self.config.concurrency_for(task))
                .max(1);
            let requests = task.requests(&self.config.defaults);

            let span = info_span!("run_task", task = %task.name);
            async {
                info!(paths = requests.len(), concurrency, "Starting task");
                let mut rx = self.orchestrator().run(connector, requests, concurrency);
                while let Some(result) = rx.recv().await {
                    emit(&result)?;
                    results.push(result);
                }
                anyhow::Ok(())
            }
            .instrument(span)
            .await?;
        }
        Ok(results)
    }
}
