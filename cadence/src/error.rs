use std::path::PathBuf;
use thiserror::Error;

use crate::capacity::NodeId;
use crate::job::ErrorKind;

/// Errors surfaced by the task executor.
///
/// These are values consumed by the workflow engine, never process faults.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("no worker node is available")]
    NoCapacityAvailable,

    #[error("launch rejected by platform: {reason}")]
    LaunchRejected { reason: String },

    #[error("execution failed ({kind}): {detail}")]
    ExecutionFailed { kind: ErrorKind, detail: String },
}

impl TaskError {
    /// The taxonomy kind a retry policy matches against.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::NoCapacityAvailable => ErrorKind::NoCapacityAvailable,
            TaskError::LaunchRejected { .. } => ErrorKind::LaunchRejected,
            TaskError::ExecutionFailed { kind, .. } => *kind,
        }
    }
}

/// Errors raised by the capacity manager.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CapacityError {
    /// The platform could not create a node; retried on the next pass.
    #[error("provisioning node {node} failed: {reason}")]
    ProvisioningFailed { node: NodeId, reason: String },

    /// The platform could not terminate a draining node; retried on the next pass.
    #[error("terminating node {node} failed: {reason}")]
    TerminationFailed { node: NodeId, reason: String },

    #[error("node {0} is not available for assignment")]
    NodeUnavailable(NodeId),

    #[error("node {0} is not part of the pool")]
    UnknownNode(NodeId),

    #[error("invalid capacity target: min={min} desired={desired} max={max}")]
    InvalidTarget {
        min: usize,
        desired: usize,
        max: usize,
    },
}

/// Failures reported by an execution platform backend.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PlatformError {
    /// The platform refused the request (quota, bad request, missing binary).
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The platform could not be reached or did not answer.
    #[error("platform unavailable: {0}")]
    Unavailable(String),

    /// The referenced node or process does not exist on the platform.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Raised when a run is asked to make a transition its state machine forbids.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("illegal transition {from} -> {to} for run {run_id}")]
pub struct TransitionError {
    pub run_id: crate::job::RunId,
    pub from: crate::run::RunState,
    pub to: crate::run::RunState,
}

/// A schedule expression that is not a valid `rate(<n> <unit>)`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid schedule expression {expression:?}: {reason}")]
pub struct ScheduleError {
    pub expression: String,
    pub reason: String,
}

/// Errors loading or validating the deployment configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}
