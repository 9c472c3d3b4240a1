use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use uuid::Uuid;

use super::{ExecutionPlatform, ProcessHandle, ProcessStatus};
use crate::capacity::NodeId;
use crate::error::PlatformError;
use crate::job::JobDefinition;

/// How [`LocalPlatform`] runs a job's command.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ProcessMode {
    /// Run the command directly on the host. The image and memory limit are
    /// recorded but not enforced.
    #[default]
    Host,
    /// Run `<binary> run --rm --memory <n>m <image> <command...>`.
    Container { binary: String },
}

struct LocalProcess {
    node_id: NodeId,
    child: Child,
}

/// Execution platform backed by local child processes.
///
/// Nodes are bookkeeping entries; terminating a node kills every process
/// still running on it, after which their status reads as unknown.
pub struct LocalPlatform {
    mode: ProcessMode,
    nodes: Mutex<HashSet<NodeId>>,
    processes: Mutex<HashMap<ProcessHandle, LocalProcess>>,
}

impl std::fmt::Debug for LocalPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPlatform")
            .field("mode", &self.mode)
            .field("nodes", &self.nodes.lock().len())
            .field("processes", &self.processes.lock().len())
            .finish()
    }
}

impl LocalPlatform {
    pub fn new(mode: ProcessMode) -> Self {
        Self {
            mode,
            nodes: Mutex::new(HashSet::new()),
            processes: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> &ProcessMode {
        &self.mode
    }

    fn command_for(&self, job: &JobDefinition) -> Result<Command, PlatformError> {
        match &self.mode {
            ProcessMode::Host => {
                let (program, args) = job.command().split_first().ok_or_else(|| {
                    PlatformError::Rejected(format!(
                        "job {} has an empty command",
                        job.family()
                    ))
                })?;
                tracing::debug!(
                    family = %job.family(),
                    image = %job.image(),
                    memory_limit_mib = job.memory_limit_mib(),
                    "host mode ignores image and memory limit"
                );
                let mut command = Command::new(program);
                command.args(args);
                Ok(command)
            }
            ProcessMode::Container { binary } => {
                let mut command = Command::new(binary);
                command
                    .arg("run")
                    .arg("--rm")
                    .arg("--memory")
                    .arg(format!("{}m", job.memory_limit_mib()))
                    .arg(job.image())
                    .args(job.command());
                Ok(command)
            }
        }
    }
}

fn forward_output<R>(reader: R, stream: String, source: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::info!(stream = %stream, source, "{line}");
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(stream = %stream, source, "log read failed: {err}");
                    break;
                }
            }
        }
    });
}

fn exit_status(status: std::process::ExitStatus) -> ProcessStatus {
    if let Some(code) = status.code() {
        return ProcessStatus::Exited { code };
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ProcessStatus::Killed {
                detail: format!("terminated by signal {signal}"),
            };
        }
    }
    ProcessStatus::Killed {
        detail: status.to_string(),
    }
}

#[async_trait]
impl ExecutionPlatform for LocalPlatform {
    async fn create_node(&self, node_id: NodeId) -> Result<(), PlatformError> {
        self.nodes.lock().insert(node_id);
        tracing::debug!(node_id = %node_id, "local node created");
        Ok(())
    }

    async fn terminate_node(
        &self,
        node_id: NodeId,
    ) -> Result<(), PlatformError> {
        if !self.nodes.lock().remove(&node_id) {
            return Err(PlatformError::NotFound(format!("node {node_id}")));
        }

        let mut processes = self.processes.lock();
        let orphaned: Vec<ProcessHandle> = processes
            .iter()
            .filter(|(_, p)| p.node_id == node_id)
            .map(|(h, _)| h.clone())
            .collect();
        for handle in orphaned {
            if let Some(mut process) = processes.remove(&handle) {
                if let Err(err) = process.child.start_kill() {
                    tracing::warn!(%handle, "kill on node termination failed: {err}");
                }
            }
        }
        tracing::debug!(node_id = %node_id, "local node terminated");
        Ok(())
    }

    async fn start_process(
        &self,
        job: &JobDefinition,
        node_id: NodeId,
    ) -> Result<ProcessHandle, PlatformError> {
        if !self.nodes.lock().contains(&node_id) {
            return Err(PlatformError::NotFound(format!("node {node_id}")));
        }

        let mut command = self.command_for(job)?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| {
            PlatformError::Rejected(format!("spawn {}: {err}", job.family()))
        })?;

        let handle = ProcessHandle(format!("{}-{}", job.family(), Uuid::now_v7()));
        let stream = format!("{}/{}", job.log_destination().stream_prefix, handle);
        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, stream.clone(), "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, stream, "stderr");
        }

        self.processes
            .lock()
            .insert(handle.clone(), LocalProcess { node_id, child });
        Ok(handle)
    }

    async fn get_process_status(
        &self,
        handle: &ProcessHandle,
    ) -> Result<ProcessStatus, PlatformError> {
        let mut processes = self.processes.lock();
        let Some(process) = processes.get_mut(handle) else {
            return Ok(ProcessStatus::Unknown);
        };
        match process.child.try_wait() {
            Ok(Some(status)) => {
                let status = exit_status(status);
                processes.remove(handle);
                Ok(status)
            }
            Ok(None) => Ok(ProcessStatus::Running),
            Err(err) => Err(PlatformError::Unavailable(format!(
                "wait {handle}: {err}"
            ))),
        }
    }
}
