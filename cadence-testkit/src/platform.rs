use async_trait::async_trait;
use cadence::*;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// How one scripted process behaves.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ScriptedRun {
    /// `start_process` fails with `PlatformError::Rejected`.
    Reject(String),
    /// Exits with `code` on the poll after `after_polls` running polls.
    Exit { code: i32, after_polls: u32 },
    /// Killed by a signal after `after_polls` running polls.
    Kill { detail: String, after_polls: u32 },
    /// The platform forgets the process after `after_polls` running polls.
    Vanish { after_polls: u32 },
    /// Never finishes.
    Hang,
}

impl ScriptedRun {
    pub fn succeed() -> Self {
        ScriptedRun::Exit {
            code: 0,
            after_polls: 0,
        }
    }

    pub fn exit(code: i32) -> Self {
        ScriptedRun::Exit {
            code,
            after_polls: 0,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        ScriptedRun::Reject(reason.into())
    }
}

#[derive(Debug)]
struct ScriptedProcess {
    node_id: NodeId,
    run: ScriptedRun,
    polls: u32,
    finished: bool,
}

#[derive(Debug, Default)]
struct State {
    script: VecDeque<ScriptedRun>,
    nodes: HashSet<NodeId>,
    created: Vec<NodeId>,
    terminated: Vec<NodeId>,
    starts: Vec<NodeId>,
    processes: HashMap<ProcessHandle, ScriptedProcess>,
    overlapping_starts: usize,
    create_failures: u32,
    next_process: u64,
}

/// Execution platform whose processes follow a script.
///
/// Each `start_process` consumes the next [`ScriptedRun`]; once the script
/// is empty the default (immediate success) applies. Node and process
/// operations are recorded for assertions.
#[derive(Clone)]
pub struct ScriptedPlatform {
    state: Arc<Mutex<State>>,
    default_run: Arc<Mutex<ScriptedRun>>,
    fail_all_creates: Arc<Mutex<bool>>,
    fail_terminates: Arc<Mutex<bool>>,
    fail_status: Arc<Mutex<bool>>,
    create_delay: Arc<Mutex<Duration>>,
    terminate_delay: Arc<Mutex<Duration>>,
}

impl ScriptedPlatform {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            default_run: Arc::new(Mutex::new(ScriptedRun::succeed())),
            fail_all_creates: Arc::new(Mutex::new(false)),
            fail_terminates: Arc::new(Mutex::new(false)),
            fail_status: Arc::new(Mutex::new(false)),
            create_delay: Arc::new(Mutex::new(Duration::ZERO)),
            terminate_delay: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// A platform whose processes behave as listed, in order.
    pub fn with_script(runs: impl IntoIterator<Item = ScriptedRun>) -> Self {
        let platform = Self::new();
        platform.push_runs(runs);
        platform
    }

    pub fn push_runs(&self, runs: impl IntoIterator<Item = ScriptedRun>) {
        self.state.lock().script.extend(runs);
    }

    /// Behavior once the script is used up.
    pub fn set_default(&self, run: ScriptedRun) {
        *self.default_run.lock() = run;
    }

    /// Fail the next `count` node creations.
    pub fn fail_next_creates(&self, count: u32) {
        self.state.lock().create_failures = count;
    }

    pub fn set_fail_all_creates(&self, fail: bool) {
        *self.fail_all_creates.lock() = fail;
    }

    pub fn set_fail_terminates(&self, fail: bool) {
        *self.fail_terminates.lock() = fail;
    }

    /// Make status polls return `PlatformError::Unavailable`.
    pub fn set_fail_status(&self, fail: bool) {
        *self.fail_status.lock() = fail;
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = delay;
    }

    pub fn set_terminate_delay(&self, delay: Duration) {
        *self.terminate_delay.lock() = delay;
    }

    pub fn created(&self) -> Vec<NodeId> {
        self.state.lock().created.clone()
    }

    pub fn terminated(&self) -> Vec<NodeId> {
        self.state.lock().terminated.clone()
    }

    /// Node of every successful `start_process`, in order.
    pub fn starts(&self) -> Vec<NodeId> {
        self.state.lock().starts.clone()
    }

    /// Starts that landed on a node whose previous process had not finished.
    pub fn overlapping_starts(&self) -> usize {
        self.state.lock().overlapping_starts
    }

    pub fn live_nodes(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn remaining_script(&self) -> usize {
        self.state.lock().script.len()
    }
}

impl Default for ScriptedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionPlatform for ScriptedPlatform {
    async fn create_node(&self, node_id: NodeId) -> Result<(), PlatformError> {
        let delay = *self.create_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_all_creates.lock() {
            return Err(PlatformError::Unavailable("no instances available".into()));
        }
        let mut state = self.state.lock();
        if state.create_failures > 0 {
            state.create_failures -= 1;
            return Err(PlatformError::Unavailable("instance launch failed".into()));
        }
        state.nodes.insert(node_id);
        state.created.push(node_id);
        Ok(())
    }

    async fn terminate_node(&self, node_id: NodeId) -> Result<(), PlatformError> {
        let delay = *self.terminate_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_terminates.lock() {
            return Err(PlatformError::Unavailable("terminate call failed".into()));
        }
        let mut state = self.state.lock();
        if !state.nodes.remove(&node_id) {
            return Err(PlatformError::NotFound(format!("node {node_id}")));
        }
        state.terminated.push(node_id);
        Ok(())
    }

    async fn start_process(
        &self,
        job: &JobDefinition,
        node_id: NodeId,
    ) -> Result<ProcessHandle, PlatformError> {
        let default_run = self.default_run.lock().clone();
        let mut state = self.state.lock();
        if !state.nodes.contains(&node_id) {
            return Err(PlatformError::NotFound(format!("node {node_id}")));
        }
        let run = state.script.pop_front().unwrap_or(default_run);
        if let ScriptedRun::Reject(reason) = run {
            return Err(PlatformError::Rejected(reason));
        }

        let busy = state
            .processes
            .values()
            .any(|p| p.node_id == node_id && !p.finished);
        if busy {
            state.overlapping_starts += 1;
        }

        state.next_process += 1;
        let handle =
            ProcessHandle(format!("{}/{}", job.family(), state.next_process));
        state.starts.push(node_id);
        state.processes.insert(
            handle.clone(),
            ScriptedProcess {
                node_id,
                run,
                polls: 0,
                finished: false,
            },
        );
        Ok(handle)
    }

    async fn get_process_status(
        &self,
        handle: &ProcessHandle,
    ) -> Result<ProcessStatus, PlatformError> {
        if *self.fail_status.lock() {
            return Err(PlatformError::Unavailable("describe call failed".into()));
        }
        let mut state = self.state.lock();
        let State {
            nodes, processes, ..
        } = &mut *state;
        let Some(process) = processes.get_mut(handle) else {
            return Ok(ProcessStatus::Unknown);
        };
        if !nodes.contains(&process.node_id) {
            process.finished = true;
            return Ok(ProcessStatus::Unknown);
        }

        let polls = process.polls;
        process.polls += 1;
        let status = match &process.run {
            ScriptedRun::Exit { code, after_polls } if polls >= *after_polls => {
                ProcessStatus::Exited { code: *code }
            }
            ScriptedRun::Kill {
                detail,
                after_polls,
            } if polls >= *after_polls => ProcessStatus::Killed {
                detail: detail.clone(),
            },
            ScriptedRun::Vanish { after_polls } if polls >= *after_polls => {
                ProcessStatus::Unknown
            }
            _ => ProcessStatus::Running,
        };
        if status != ProcessStatus::Running {
            process.finished = true;
        }
        Ok(status)
    }
}
