use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::capacity::{NodeId, NodeState};
use crate::job::RunId;
use crate::run::Transition;

/// Metadata envelope attached to every orchestrator event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub correlation_id: Uuid,
    pub idempotency_key: String,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(
        correlation_id: Option<Uuid>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            version: 1,
            correlation_id: correlation_id.unwrap_or_else(Uuid::now_v7),
            idempotency_key: idempotency_key.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Event describing the lifecycle of a workflow run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunEvent {
    pub meta: EventMeta,
    pub payload: RunEventPayload,
}

impl RunEvent {
    /// Build an event correlated to the run it describes.
    pub fn for_run(run_id: RunId, key: &str, payload: RunEventPayload) -> Self {
        Self {
            meta: EventMeta::new(
                Some(run_id.as_uuid()),
                format!("{key}-{run_id}"),
            ),
            payload,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum RunEventPayload {
    /// A trigger tick created the run and handed it to the engine.
    Scheduled { run_id: RunId },
    /// The run moved between states.
    Transitioned(Transition),
    /// The tick could not hand the run off and was dropped.
    TickAbandoned { run_id: RunId, reason: String },
}

/// Event describing an action taken by the capacity manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapacityEvent {
    pub meta: EventMeta,
    pub payload: CapacityEventPayload,
}

impl CapacityEvent {
    pub fn new(pass_id: Option<Uuid>, payload: CapacityEventPayload) -> Self {
        let key = match &payload {
            CapacityEventPayload::NodeStateChanged { node_id, to, .. } => {
                format!("node-{node_id}-{}", to.as_str())
            }
            CapacityEventPayload::ProvisioningFailed { node_id, .. } => {
                format!("provision-failed-{node_id}")
            }
            CapacityEventPayload::TerminationFailed { node_id, .. } => {
                format!("terminate-failed-{node_id}")
            }
            CapacityEventPayload::DemandRecorded { pending } => {
                format!("demand-{pending}")
            }
        };
        Self {
            meta: EventMeta::new(pass_id, key),
            payload,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum CapacityEventPayload {
    /// A node changed state.
    NodeStateChanged {
        node_id: NodeId,
        /// `None` when the node was just created.
        from: Option<NodeState>,
        to: NodeState,
    },
    /// The platform could not create a node.
    ProvisioningFailed { node_id: NodeId, reason: String },
    /// The platform could not terminate a draining node.
    TerminationFailed { node_id: NodeId, reason: String },
    /// A launch found no capacity and registered demand for scale-out.
    DemandRecorded { pending: usize },
}

/// Sink for orchestrator events.
///
/// Implement this to bridge events to an external bus; [`InProcEventBus`]
/// covers the in-process case.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_run(&self, event: RunEvent) -> anyhow::Result<()>;

    async fn publish_capacity(&self, event: CapacityEvent)
    -> anyhow::Result<()>;
}

/// Source of orchestrator events for subscribers.
pub trait EventStream: Send + Sync {
    fn subscribe_runs(&self) -> broadcast::Receiver<RunEvent>;

    fn subscribe_capacity(&self) -> broadcast::Receiver<CapacityEvent>;
}

/// In-process event bus using tokio broadcast channels.
///
/// Publishing never waits for subscribers: a subscriber that falls behind
/// receives `RecvError::Lagged` and the oldest events are dropped. Events
/// published with no subscribers are discarded.
pub struct InProcEventBus {
    run_sender: broadcast::Sender<RunEvent>,
    capacity_sender: broadcast::Sender<CapacityEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("run_subscribers", &self.run_sender.receiver_count())
            .field(
                "capacity_subscribers",
                &self.capacity_sender.receiver_count(),
            )
            .finish()
    }
}

impl InProcEventBus {
    /// Create a bus buffering up to `capacity` events per channel.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (run_sender, _) = broadcast::channel(capacity);
        let (capacity_sender, _) = broadcast::channel(capacity);
        Self {
            run_sender,
            capacity_sender,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn run_subscriber_count(&self) -> usize {
        self.run_sender.receiver_count()
    }

    pub fn capacity_subscriber_count(&self) -> usize {
        self.capacity_sender.receiver_count()
    }
}

#[async_trait]
impl EventPublisher for InProcEventBus {
    async fn publish_run(&self, event: RunEvent) -> anyhow::Result<()> {
        let _ = self.run_sender.send(event);
        Ok(())
    }

    async fn publish_capacity(
        &self,
        event: CapacityEvent,
    ) -> anyhow::Result<()> {
        let _ = self.capacity_sender.send(event);
        Ok(())
    }
}

impl EventStream for InProcEventBus {
    fn subscribe_runs(&self) -> broadcast::Receiver<RunEvent> {
        self.run_sender.subscribe()
    }

    fn subscribe_capacity(&self) -> broadcast::Receiver<CapacityEvent> {
        self.capacity_sender.subscribe()
    }
}
