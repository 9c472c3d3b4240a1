use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::capacity::NodeId;
use crate::error::PlatformError;
use crate::job::JobDefinition;

/// Host-process backend for running jobs without a cloud provider.
pub mod local;

pub use local::{LocalPlatform, ProcessMode};

/// Platform-assigned identifier of a started process.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ProcessHandle(pub String);

impl Display for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw process status as reported by a backend.
///
/// Translation into the shared [`ErrorKind`](crate::job::ErrorKind)
/// taxonomy happens in the task executor.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ProcessStatus {
    /// Still executing.
    Running,
    /// Exited with the given status code.
    Exited { code: i32 },
    /// Terminated by a signal or crashed before producing an exit code.
    Killed { detail: String },
    /// The backend has no record of the process.
    Unknown,
}

/// The four capabilities the orchestrator needs from an execution platform.
///
/// Any backend implementing these satisfies the contract: the capacity
/// manager uses the node operations, the task executor the process ones.
#[async_trait]
pub trait ExecutionPlatform: Send + Sync + 'static {
    /// Bring up a worker node under the given identifier.
    async fn create_node(&self, node_id: NodeId) -> Result<(), PlatformError>;

    /// Tear down a worker node.
    async fn terminate_node(
        &self,
        node_id: NodeId,
    ) -> Result<(), PlatformError>;

    /// Start the job's container process on a node.
    async fn start_process(
        &self,
        job: &JobDefinition,
        node_id: NodeId,
    ) -> Result<ProcessHandle, PlatformError>;

    /// Report the current status of a process without blocking on it.
    async fn get_process_status(
        &self,
        handle: &ProcessHandle,
    ) -> Result<ProcessStatus, PlatformError>;
}
