use async_trait::async_trait;
use cadence::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Event publisher that keeps every event it is given.
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    runs: Arc<Mutex<Vec<RunEvent>>>,
    capacity: Arc<Mutex<Vec<CapacityEvent>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish return an error. Events are still recorded.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn run_events(&self) -> Vec<RunEvent> {
        self.runs.lock().clone()
    }

    pub fn capacity_events(&self) -> Vec<CapacityEvent> {
        self.capacity.lock().clone()
    }

    /// Transitions published for one run, in order.
    pub fn transitions_for(&self, run_id: RunId) -> Vec<Transition> {
        self.runs
            .lock()
            .iter()
            .filter_map(|event| match &event.payload {
                RunEventPayload::Transitioned(t) if t.run_id == run_id => {
                    Some(t.clone())
                }
                _ => None,
            })
            .collect()
    }

    pub fn scheduled_count(&self) -> usize {
        self.runs
            .lock()
            .iter()
            .filter(|e| matches!(e.payload, RunEventPayload::Scheduled { .. }))
            .count()
    }

    pub fn abandoned_count(&self) -> usize {
        self.runs
            .lock()
            .iter()
            .filter(|e| {
                matches!(e.payload, RunEventPayload::TickAbandoned { .. })
            })
            .count()
    }

    /// Node state changes in publish order, as `(node, from, to)`.
    pub fn node_changes(&self) -> Vec<(NodeId, Option<NodeState>, NodeState)> {
        self.capacity
            .lock()
            .iter()
            .filter_map(|event| match &event.payload {
                CapacityEventPayload::NodeStateChanged { node_id, from, to } => {
                    Some((*node_id, *from, *to))
                }
                _ => None,
            })
            .collect()
    }

    pub fn provisioning_failures(&self) -> usize {
        self.capacity
            .lock()
            .iter()
            .filter(|e| {
                matches!(e.payload, CapacityEventPayload::ProvisioningFailed { .. })
            })
            .count()
    }

    pub fn clear(&self) {
        self.runs.lock().clear();
        self.capacity.lock().clear();
    }

    fn result(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("publisher unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish_run(&self, event: RunEvent) -> anyhow::Result<()> {
        self.runs.lock().push(event);
        self.result()
    }

    async fn publish_capacity(
        &self,
        event: CapacityEvent,
    ) -> anyhow::Result<()> {
        self.capacity.lock().push(event);
        self.result()
    }
}

/// Run launcher that records hand-offs instead of executing them.
#[derive(Clone, Default)]
pub struct RecordingLauncher {
    runs: Arc<Mutex<Vec<WorkflowRun>>>,
    refusing: Arc<AtomicBool>,
}

impl RecordingLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A launcher whose every hand-off fails.
    pub fn refusing() -> Self {
        let launcher = Self::default();
        launcher.refusing.store(true, Ordering::SeqCst);
        launcher
    }

    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    pub fn runs(&self) -> Vec<WorkflowRun> {
        self.runs.lock().clone()
    }

    pub fn assert_hand_off_count_eq(&self, expected: usize) {
        let actual = self.runs.lock().len();
        assert_eq!(
            actual, expected,
            "Expected {expected} hand-offs, got {actual}"
        );
    }
}

#[async_trait]
impl RunLauncher for RecordingLauncher {
    async fn hand_off(&self, run: WorkflowRun) -> anyhow::Result<()> {
        if self.refusing.load(Ordering::SeqCst) {
            anyhow::bail!("launcher refused run {}", run.id());
        }
        self.runs.lock().push(run);
        Ok(())
    }
}
