use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::job::RunId;
use crate::run::WorkflowRun;

pub const DEFAULT_ARCHIVE_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct ArchiveInner {
    runs: HashMap<RunId, WorkflowRun>,
    order: VecDeque<RunId>,
}

/// Bounded in-memory store of terminal runs.
///
/// Holds at most `capacity` runs; the oldest is evicted first. Cloning the
/// archive shares the same storage.
#[derive(Clone, Debug)]
pub struct RunArchive {
    inner: Arc<Mutex<ArchiveInner>>,
    capacity: usize,
}

impl Default for RunArchive {
    fn default() -> Self {
        Self::new(DEFAULT_ARCHIVE_CAPACITY)
    }
}

impl RunArchive {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ArchiveInner::default())),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store a terminal run. Non-terminal runs are refused.
    pub async fn insert(&self, run: WorkflowRun) -> bool {
        if !run.is_terminal() {
            warn!(run_id = %run.id(), state = %run.state(), "refusing to archive live run");
            return false;
        }

        let mut guard = self.inner.lock().await;
        let id = run.id();
        if guard.runs.insert(id, run).is_none() {
            guard.order.push_back(id);
        }
        while guard.order.len() > self.capacity {
            if let Some(evicted) = guard.order.pop_front() {
                guard.runs.remove(&evicted);
                debug!(run_id = %evicted, "evicted run from archive");
            }
        }
        true
    }

    pub async fn get(&self, id: RunId) -> Option<WorkflowRun> {
        let guard = self.inner.lock().await;
        guard.runs.get(&id).cloned()
    }

    /// Archived runs, newest first.
    pub async fn recent(&self) -> Vec<WorkflowRun> {
        let guard = self.inner.lock().await;
        guard
            .order
            .iter()
            .rev()
            .filter_map(|id| guard.runs.get(id).cloned())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
