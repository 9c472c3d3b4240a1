use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::capacity::{CapacityManager, Node, NodeId};
use crate::error::TaskError;
use crate::job::{ErrorKind, JobDefinition};
use crate::platform::{ExecutionPlatform, ProcessHandle, ProcessStatus};

const FINISHED_HISTORY: usize = 1024;

/// Exit code reported when the kernel OOM killer stops a container.
pub const OOM_EXIT_CODE: i32 = 137;

/// Reference to one launched attempt.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OutcomeHandle {
    pub process: ProcessHandle,
    pub node_id: NodeId,
    pub launched_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: i32,
    pub observed_at: DateTime<Utc>,
}

/// What a poll observed about an attempt.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Running,
    Succeeded(ExitInfo),
    Failed { kind: ErrorKind, detail: String },
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Running)
    }

    fn from_status(status: ProcessStatus) -> Self {
        match status {
            ProcessStatus::Running => Outcome::Running,
            ProcessStatus::Exited { code: 0 } => Outcome::Succeeded(ExitInfo {
                code: 0,
                observed_at: Utc::now(),
            }),
            ProcessStatus::Exited { code: OOM_EXIT_CODE } => Outcome::Failed {
                kind: ErrorKind::OutOfMemory,
                detail: format!("exit status {OOM_EXIT_CODE}"),
            },
            ProcessStatus::Exited { code } => Outcome::Failed {
                kind: ErrorKind::NonZeroExit,
                detail: format!("exit status {code}"),
            },
            ProcessStatus::Killed { detail } => Outcome::Failed {
                kind: ErrorKind::Crashed,
                detail,
            },
            ProcessStatus::Unknown => Outcome::Failed {
                kind: ErrorKind::NodeLost,
                detail: "process no longer known to the platform".into(),
            },
        }
    }
}

#[derive(Default)]
struct Assignments {
    active: HashMap<ProcessHandle, NodeId>,
    finished: HashMap<ProcessHandle, Outcome>,
    order: VecDeque<ProcessHandle>,
}

impl Assignments {
    /// Record a terminal outcome; true when this ended an active assignment.
    fn finish(&mut self, handle: &ProcessHandle, outcome: Outcome) -> bool {
        let was_active = self.active.remove(handle).is_some();
        if self.finished.insert(handle.clone(), outcome).is_none() {
            self.order.push_back(handle.clone());
            if self.order.len() > FINISHED_HISTORY {
                if let Some(evicted) = self.order.pop_front() {
                    self.finished.remove(&evicted);
                }
            }
        }
        was_active
    }
}

/// Launches the job on a pool node and reports outcomes by polling.
///
/// The executor borrows a node for exactly one assignment: it is assigned at
/// launch and released once, on the first terminal outcome observed or when
/// the attempt is abandoned. Platform failures are mapped into the
/// [`ErrorKind`] taxonomy here.
pub struct TaskExecutor<P: ExecutionPlatform> {
    platform: Arc<P>,
    capacity: Arc<CapacityManager<P>>,
    assignments: Mutex<Assignments>,
}

impl<P: ExecutionPlatform> std::fmt::Debug for TaskExecutor<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let assignments = self.assignments.lock();
        f.debug_struct("TaskExecutor")
            .field("platform", &std::any::type_name::<P>())
            .field("active", &assignments.active.len())
            .field("finished", &assignments.finished.len())
            .finish()
    }
}

impl<P: ExecutionPlatform> TaskExecutor<P> {
    pub fn new(platform: Arc<P>, capacity: Arc<CapacityManager<P>>) -> Self {
        Self {
            platform,
            capacity,
            assignments: Mutex::new(Assignments::default()),
        }
    }

    pub fn capacity(&self) -> &Arc<CapacityManager<P>> {
        &self.capacity
    }

    pub fn active_count(&self) -> usize {
        self.assignments.lock().active.len()
    }

    /// Launch on a specific node, which must be `Available`.
    pub async fn launch(
        &self,
        job: &JobDefinition,
        node_id: NodeId,
    ) -> Result<OutcomeHandle, TaskError> {
        let node = self.capacity.assign(node_id).await.map_err(|err| {
            tracing::debug!(node_id = %node_id, "launch refused: {err}");
            TaskError::NoCapacityAvailable
        })?;
        self.start_on(job, node).await
    }

    /// Launch on whichever node is `Available`, taken atomically.
    ///
    /// With no node free, demand is recorded for scale-out and
    /// `NoCapacityAvailable` is returned.
    pub async fn launch_on_pool(
        &self,
        job: &JobDefinition,
    ) -> Result<OutcomeHandle, TaskError> {
        let Some(node) = self.capacity.assign_any().await else {
            self.capacity.record_demand().await;
            return Err(TaskError::NoCapacityAvailable);
        };
        self.start_on(job, node).await
    }

    async fn start_on(
        &self,
        job: &JobDefinition,
        node: Node,
    ) -> Result<OutcomeHandle, TaskError> {
        match self.platform.start_process(job, node.id).await {
            Ok(process) => {
                tracing::info!(
                    family = %job.family(),
                    node_id = %node.id,
                    process = %process,
                    "process started"
                );
                self.assignments
                    .lock()
                    .active
                    .insert(process.clone(), node.id);
                Ok(OutcomeHandle {
                    process,
                    node_id: node.id,
                    launched_at: Utc::now(),
                })
            }
            Err(err) => {
                self.settle_node(node.id, false).await;
                Err(TaskError::LaunchRejected {
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Observe the attempt without blocking.
    ///
    /// A platform error while polling is logged and reported as `Running`;
    /// the engine's attempt timeout bounds how long that can last.
    pub async fn poll(&self, handle: &OutcomeHandle) -> Outcome {
        if let Some(outcome) = self.assignments.lock().finished.get(&handle.process)
        {
            return outcome.clone();
        }

        let status = match self.platform.get_process_status(&handle.process).await
        {
            Ok(status) => status,
            Err(err) => {
                tracing::warn!(process = %handle.process, "status poll failed: {err}");
                return Outcome::Running;
            }
        };

        let outcome = Outcome::from_status(status);
        if outcome.is_terminal() {
            let release = self
                .assignments
                .lock()
                .finish(&handle.process, outcome.clone());
            if release {
                self.settle_node(handle.node_id, false).await;
            }
        }
        outcome
    }

    /// Give up on an attempt that is still running.
    ///
    /// The platform cannot stop a single process, so the node is drained:
    /// it is terminated as it leaves its assignment and replaced by the next
    /// capacity pass. When the attempt already reached a terminal outcome,
    /// nothing is drained and that outcome is returned.
    pub async fn abandon(&self, handle: &OutcomeHandle) -> Option<Outcome> {
        {
            let mut assignments = self.assignments.lock();
            if assignments.active.remove(&handle.process).is_none() {
                return assignments.finished.get(&handle.process).cloned();
            }
        }
        tracing::warn!(
            process = %handle.process,
            node_id = %handle.node_id,
            "abandoning attempt; draining its node"
        );
        self.settle_node(handle.node_id, true).await;
        None
    }

    /// Hand a node back to the pool, draining it first when asked.
    ///
    /// Runs on its own task so a caller dropped mid-release (an attempt
    /// timeout, for one) cannot leave the node assigned or half drained.
    async fn settle_node(&self, node_id: NodeId, drain: bool) {
        let capacity = Arc::clone(&self.capacity);
        let task = tokio::spawn(async move {
            if drain {
                if let Err(err) = capacity.drain(node_id).await {
                    tracing::warn!(node_id = %node_id, "drain failed: {err}");
                }
            }
            if let Err(err) = capacity.release(node_id).await {
                tracing::warn!(node_id = %node_id, "node release failed: {err}");
            }
        });
        if let Err(err) = task.await {
            tracing::error!(node_id = %node_id, "node release task failed: {err}");
        }
    }
}
