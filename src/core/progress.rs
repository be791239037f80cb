//! In-memory tracking of the path groups currently being processed.
//!
//! Updated by the orchestrator as workers start and finish, and by the path
//! group as it moves from file to file. Nothing here is persisted; callers
//! that want live status (a log line, a status endpoint) query it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use uuid::Uuid;

use super::models::{Direction, TransferRequest};

/// Snapshot of one running path group.
#[derive(Debug, Clone)]
pub struct ActiveGroup {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub direction: Direction,
    pub current_file: Option<String>,
    pub started: Instant,
}

#[derive(Default)]
struct TrackerState {
    active: HashMap<Uuid, ActiveGroup>,
    peak: usize,
}

/// Thread-safe store of running path groups, shared by all workers of a run.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    inner: Arc<RwLock<TrackerState>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start(&self, request: &TransferRequest) {
        let mut state = self.inner.write().await;
        state.active.insert(
            request.id,
            ActiveGroup {
                source: request.source.clone(),
                destination: request.destination.clone(),
                direction: request.direction,
                current_file: None,
                started: Instant::now(),
            },
        );
        state.peak = state.peak.max(state.active.len());
    }

    pub async fn set_current_file(&self, request_id: Uuid, file_name: &str) {
        let mut state = self.inner.write().await;
        if let Some(group) = state.active.get_mut(&request_id) {
            group.current_file = Some(file_name.to_string());
        }
    }

    pub async fn finish(&self, request_id: Uuid) {
        let mut state = self.inner.write().await;
        state.active.remove(&request_id);
    }

    pub async fn get(&self, request_id: Uuid) -> Option<ActiveGroup> {
        let state = self.inner.read().await;
        state.active.get(&request_id).cloned()
    }

    pub async fn get_all(&self) -> HashMap<Uuid, ActiveGroup> {
        let state = self.inner.read().await;
        state.active.clone()
    }

    pub async fn active_count(&self) -> usize {
        let state = self.inner.read().await;
        state.active.len()
    }

    /// Largest number of groups that were running at the same time.
    pub async fn peak(&self) -> usize {
        let state = self.inner.read().await;
        state.peak
    }
}
