#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sftp_mover::core::{Orchestrator, RecordingSleeper, TransferRequest, TransferResult};
use sftp_mover::fs::{DiskFs, SimulatedConnector, SimulatedFs};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const SERVER: &str = "mover@sftp.test:22";

/// A real local directory and a simulated server.
pub struct Harness {
    pub temp: TempDir,
    pub remote: SimulatedFs,
    pub sleeper: Arc<RecordingSleeper>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_remote(SimulatedFs::named("remote"))
    }

    pub fn with_remote(remote: SimulatedFs) -> Self {
        remote.add_dir("/in");
        remote.add_dir("/out");
        Self {
            temp: TempDir::new().unwrap(),
            remote,
            sleeper: Arc::new(RecordingSleeper::new()),
        }
    }

    pub fn local(&self, relative: &str) -> PathBuf {
        self.temp.path().join(relative)
    }

    pub fn local_dir(&self, relative: &str) -> PathBuf {
        let dir = self.local(relative);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub fn write_local(&self, relative: &str, data: &[u8]) -> PathBuf {
        let path = self.local(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, data).unwrap();
        path
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::with_sleeper(
            Arc::new(DiskFs::new()),
            self.sleeper.clone(),
            CancellationToken::new(),
        )
    }

    pub fn connector(&self) -> Arc<SimulatedConnector> {
        Arc::new(SimulatedConnector::new(SERVER, self.remote.clone()))
    }

    pub async fn run(&self, requests: Vec<TransferRequest>, max_concurrency: usize) -> Vec<TransferResult> {
        self.orchestrator()
            .run_to_end(self.connector(), requests, max_concurrency)
            .await
    }
}

/// Sorted names of the regular files in `dir`.
pub fn local_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap())
        .filter(|entry| entry.file_type().unwrap().is_file())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
