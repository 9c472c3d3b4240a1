use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::CapacityError;
use crate::events::{CapacityEvent, CapacityEventPayload, EventPublisher};
use crate::platform::ExecutionPlatform;
use crate::telemetry;

const RETIRED_HISTORY: usize = 64;

/// Identifier of a worker node in the pool.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
pub struct NodeId(pub Uuid);

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle states of a worker node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    Provisioning,
    Available,
    Assigned,
    Draining,
    Terminated,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Provisioning => "provisioning",
            NodeState::Available => "available",
            NodeState::Assigned => "assigned",
            NodeState::Draining => "draining",
            NodeState::Terminated => "terminated",
        }
    }

    /// Live nodes count towards the `[min, max]` bounds.
    pub fn is_live(&self) -> bool {
        !matches!(self, NodeState::Terminated)
    }
}

impl Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A worker node as tracked by the capacity manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub state: NodeState,
    /// True while the node holds an assignment; scale-in never touches it.
    pub scale_in_protected: bool,
    /// Set by an explicit drain of an assigned node; it terminates on release.
    pub drain_requested: bool,
    pub created_at: DateTime<Utc>,
    /// Last time the node was created, assigned, or released.
    pub last_active_at: DateTime<Utc>,
    pub assignments: u64,
    #[serde(skip)]
    terminating: bool,
}

impl Node {
    fn provisioning(id: NodeId) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: NodeState::Provisioning,
            scale_in_protected: false,
            drain_requested: false,
            created_at: now,
            last_active_at: now,
            assignments: 0,
            terminating: false,
        }
    }

    fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_active_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Deploy-time bounds of the node pool.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CapacityTarget {
    min: usize,
    max: usize,
    desired: usize,
    scale_out_on_demand: bool,
    scale_in_idle: Duration,
}

impl CapacityTarget {
    /// Create a target, rejecting bounds that violate `min <= desired <= max`.
    pub fn new(
        min: usize,
        desired: usize,
        max: usize,
    ) -> Result<Self, CapacityError> {
        if min > desired || desired > max || max == 0 {
            return Err(CapacityError::InvalidTarget { min, desired, max });
        }
        Ok(Self {
            min,
            max,
            desired,
            scale_out_on_demand: false,
            scale_in_idle: Duration::from_secs(300),
        })
    }

    /// Let unmet launches raise the effective target, up to `max`.
    pub fn with_scale_out_on_demand(mut self, enabled: bool) -> Self {
        self.scale_out_on_demand = enabled;
        self
    }

    /// How long an available node above target must sit idle before scale-in.
    pub fn with_scale_in_idle(mut self, idle: Duration) -> Self {
        self.scale_in_idle = idle;
        self
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn desired(&self) -> usize {
        self.desired
    }

    pub fn scale_out_on_demand(&self) -> bool {
        self.scale_out_on_demand
    }

    pub fn scale_in_idle(&self) -> Duration {
        self.scale_in_idle
    }

    fn effective(&self, pending_demand: usize) -> usize {
        if self.scale_out_on_demand {
            self.desired.saturating_add(pending_demand).min(self.max)
        } else {
            self.desired
        }
    }
}

/// Point-in-time node counts per state.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub provisioning: usize,
    pub available: usize,
    pub assigned: usize,
    pub draining: usize,
    /// Terminated nodes still held in the recent history.
    pub terminated: usize,
}

impl PoolSnapshot {
    pub fn live(&self) -> usize {
        self.provisioning + self.available + self.assigned + self.draining
    }
}

/// Summary of one `ensure_capacity` pass.
#[derive(Clone, Debug, Default)]
pub struct ReconcileReport {
    pub target: usize,
    pub provisioned: Vec<NodeId>,
    pub terminated: Vec<NodeId>,
    /// Failures from this pass; each is retried on the next one.
    pub errors: Vec<CapacityError>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.provisioned.is_empty()
            && self.terminated.is_empty()
            && self.errors.is_empty()
    }
}

#[derive(Default)]
struct Pool {
    nodes: BTreeMap<NodeId, Node>,
    retired: VecDeque<Node>,
    pending_demand: usize,
}

impl Pool {
    fn live_count(&self) -> usize {
        self.nodes.values().filter(|n| n.state.is_live()).count()
    }

    fn snapshot(&self) -> PoolSnapshot {
        let mut snapshot = PoolSnapshot {
            terminated: self.retired.len(),
            ..PoolSnapshot::default()
        };
        for node in self.nodes.values() {
            match node.state {
                NodeState::Provisioning => snapshot.provisioning += 1,
                NodeState::Available => snapshot.available += 1,
                NodeState::Assigned => snapshot.assigned += 1,
                NodeState::Draining => snapshot.draining += 1,
                NodeState::Terminated => snapshot.terminated += 1,
            }
        }
        snapshot
    }

    fn set_state(
        &mut self,
        id: NodeId,
        to: NodeState,
        changes: &mut Vec<(NodeId, Option<NodeState>, NodeState)>,
    ) {
        if let Some(node) = self.nodes.get_mut(&id) {
            let from = node.state;
            node.state = to;
            node.scale_in_protected = to == NodeState::Assigned;
            changes.push((id, Some(from), to));
        }
    }

    fn retire(
        &mut self,
        id: NodeId,
        changes: &mut Vec<(NodeId, Option<NodeState>, NodeState)>,
    ) {
        self.set_state(id, NodeState::Terminated, changes);
        if let Some(node) = self.nodes.remove(&id) {
            if self.retired.len() == RETIRED_HISTORY {
                self.retired.pop_front();
            }
            self.retired.push_back(node);
        }
    }
}

type NodeChange = (NodeId, Option<NodeState>, NodeState);

/// Keeps the worker pool between `min` and `max`, aiming at `desired`.
///
/// The manager exclusively owns the node set. Every state mutation happens
/// under a single `tokio::sync::Mutex`, which makes `Available -> Assigned`
/// atomic with respect to concurrent runs. Reconcile passes are serialized
/// by a second lock so two passes never plan against the same pool state.
pub struct CapacityManager<P: ExecutionPlatform> {
    cluster_name: String,
    target: CapacityTarget,
    platform: Arc<P>,
    events: Arc<dyn EventPublisher>,
    pool: Arc<Mutex<Pool>>,
    reconcile: Mutex<()>,
}

impl<P: ExecutionPlatform> std::fmt::Debug for CapacityManager<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("CapacityManager");
        debug.field("cluster_name", &self.cluster_name);
        debug.field("target", &self.target);

        match self.pool.try_lock() {
            Ok(pool) => {
                debug.field("pool", &pool.snapshot());
            }
            Err(_) => {
                debug.field("pool", &"<locked>");
            }
        }

        debug.finish_non_exhaustive()
    }
}

impl<P: ExecutionPlatform> CapacityManager<P> {
    pub fn new(
        cluster_name: impl Into<String>,
        target: CapacityTarget,
        platform: Arc<P>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            target,
            platform,
            events,
            pool: Arc::new(Mutex::new(Pool::default())),
            reconcile: Mutex::new(()),
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn target(&self) -> &CapacityTarget {
        &self.target
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        self.pool.lock().await.snapshot()
    }

    pub async fn live_count(&self) -> usize {
        self.pool.lock().await.live_count()
    }

    /// Look up a node, including recently terminated ones.
    pub async fn node(&self, id: NodeId) -> Option<Node> {
        let pool = self.pool.lock().await;
        pool.nodes
            .get(&id)
            .or_else(|| pool.retired.iter().rev().find(|n| n.id == id))
            .cloned()
    }

    pub async fn nodes(&self) -> Vec<Node> {
        self.pool.lock().await.nodes.values().cloned().collect()
    }

    /// Bring the live node count to target.
    ///
    /// Provisions when short and drains excess idle `Available` nodes when
    /// over. Assigned nodes are never selected for scale-in. Platform
    /// failures are reported in the returned report and retried on the next
    /// pass.
    pub async fn ensure_capacity(&self) -> ReconcileReport {
        let _pass = self.reconcile.lock().await;
        let span = telemetry::reconcile_span(&self.cluster_name);
        self.reconcile_pass(Uuid::now_v7()).instrument(span).await
    }

    async fn reconcile_pass(&self, pass_id: Uuid) -> ReconcileReport {
        let mut changes = Vec::new();
        let mut failures = Vec::new();
        let mut report = ReconcileReport::default();

        // Scale-in runs first so provisioning sees the live count that is
        // left once draining nodes are gone.
        let (target, to_terminate) = {
            let mut pool = self.pool.lock().await;
            let live = pool.live_count();
            let target = self.target.effective(pool.pending_demand);
            pool.pending_demand = 0;

            if live > target {
                let already_draining = pool
                    .nodes
                    .values()
                    .filter(|n| n.state == NodeState::Draining)
                    .count();
                let excess = (live - target).saturating_sub(already_draining);
                let now = Utc::now();
                let idle = self.target.scale_in_idle;
                let victims: Vec<NodeId> = pool
                    .nodes
                    .values()
                    .filter(|n| {
                        n.state == NodeState::Available
                            && !n.scale_in_protected
                            && n.idle_for(now) >= idle
                    })
                    .map(|n| n.id)
                    .take(excess)
                    .collect();
                for id in victims {
                    pool.set_state(id, NodeState::Draining, &mut changes);
                }
            }

            // Draining nodes whose termination is not already in flight,
            // including ones a previous pass failed to terminate.
            let mut to_terminate = Vec::new();
            for node in pool.nodes.values_mut() {
                if node.state == NodeState::Draining && !node.terminating {
                    node.terminating = true;
                    to_terminate.push(node.id);
                }
            }
            (target, to_terminate)
        };
        report.target = target;

        for id in to_terminate {
            match self.terminate(id, &mut changes).await {
                Ok(()) => report.terminated.push(id),
                Err(err) => {
                    if let CapacityError::TerminationFailed { node, reason } =
                        &err
                    {
                        failures.push(CapacityEventPayload::TerminationFailed {
                            node_id: *node,
                            reason: reason.clone(),
                        });
                    }
                    report.errors.push(err);
                }
            }
        }

        let to_provision = {
            let mut pool = self.pool.lock().await;
            let live = pool.live_count();
            let mut to_provision = Vec::new();
            for _ in live..target {
                let id = NodeId::new();
                pool.nodes.insert(id, Node::provisioning(id));
                changes.push((id, None, NodeState::Provisioning));
                to_provision.push(id);
            }
            tracing::debug!(
                cluster = %self.cluster_name,
                live,
                target,
                provision = to_provision.len(),
                terminated = report.terminated.len(),
                "capacity pass planned"
            );
            to_provision
        };

        for id in to_provision {
            match self.platform.create_node(id).await {
                Ok(()) => {
                    let mut pool = self.pool.lock().await;
                    pool.set_state(id, NodeState::Available, &mut changes);
                    if let Some(node) = pool.nodes.get_mut(&id) {
                        node.last_active_at = Utc::now();
                    }
                    report.provisioned.push(id);
                }
                Err(err) => {
                    let reason = err.to_string();
                    telemetry::record_provisioning_failed(
                        &self.cluster_name,
                        id,
                        &reason,
                    );
                    self.pool.lock().await.retire(id, &mut changes);
                    failures.push(CapacityEventPayload::ProvisioningFailed {
                        node_id: id,
                        reason: reason.clone(),
                    });
                    report.errors.push(CapacityError::ProvisioningFailed {
                        node: id,
                        reason,
                    });
                }
            }
        }

        self.publish_changes(Some(pass_id), changes).await;
        for payload in failures {
            let event = CapacityEvent::new(Some(pass_id), payload);
            if let Err(err) = self.events.publish_capacity(event).await {
                tracing::error!("publish capacity event failed: {err}");
            }
        }
        telemetry::set_pool_gauges(&self.cluster_name, &self.snapshot().await);

        report
    }

    /// Atomically move a specific `Available` node to `Assigned`.
    pub async fn assign(&self, id: NodeId) -> Result<Node, CapacityError> {
        let mut changes = Vec::new();
        let node = {
            let mut pool = self.pool.lock().await;
            let node = pool
                .nodes
                .get(&id)
                .ok_or(CapacityError::UnknownNode(id))?;
            if node.state != NodeState::Available || node.drain_requested {
                return Err(CapacityError::NodeUnavailable(id));
            }
            Self::mark_assigned(&mut pool, id, &mut changes)
        };
        self.publish_changes(None, changes).await;
        node.ok_or(CapacityError::UnknownNode(id))
    }

    /// Atomically take the oldest `Available` node, if any.
    pub async fn assign_any(&self) -> Option<Node> {
        let mut changes = Vec::new();
        let node = {
            let mut pool = self.pool.lock().await;
            let id = pool
                .nodes
                .values()
                .find(|n| n.state == NodeState::Available && !n.drain_requested)
                .map(|n| n.id)?;
            Self::mark_assigned(&mut pool, id, &mut changes)
        };
        self.publish_changes(None, changes).await;
        node
    }

    fn mark_assigned(
        pool: &mut Pool,
        id: NodeId,
        changes: &mut Vec<NodeChange>,
    ) -> Option<Node> {
        pool.set_state(id, NodeState::Assigned, changes);
        let node = pool.nodes.get_mut(&id)?;
        node.assignments += 1;
        node.last_active_at = Utc::now();
        Some(node.clone())
    }

    /// Return an assigned node to the pool when its assignment ends.
    ///
    /// The node becomes `Available` again, or, when a drain was requested
    /// while it was busy, goes through `Draining` to `Terminated`.
    pub async fn release(&self, id: NodeId) -> Result<NodeState, CapacityError> {
        let mut changes = Vec::new();
        let drain = {
            let mut pool = self.pool.lock().await;
            let node = pool
                .nodes
                .get(&id)
                .ok_or(CapacityError::UnknownNode(id))?;
            if node.state != NodeState::Assigned {
                return Ok(node.state);
            }
            if node.drain_requested {
                pool.set_state(id, NodeState::Draining, &mut changes);
                if let Some(node) = pool.nodes.get_mut(&id) {
                    node.terminating = true;
                }
                true
            } else {
                pool.set_state(id, NodeState::Available, &mut changes);
                if let Some(node) = pool.nodes.get_mut(&id) {
                    node.last_active_at = Utc::now();
                }
                false
            }
        };

        let result = if drain {
            match self.terminate(id, &mut changes).await {
                Ok(()) => Ok(NodeState::Terminated),
                Err(err) => {
                    tracing::warn!(node = %id, "drain on release failed: {err}");
                    Ok(NodeState::Draining)
                }
            }
        } else {
            Ok(NodeState::Available)
        };

        self.publish_changes(None, changes).await;
        result
    }

    /// Take a node out of service.
    ///
    /// Available nodes are terminated now; assigned nodes are flagged and
    /// terminated when their assignment ends.
    pub async fn drain(&self, id: NodeId) -> Result<NodeState, CapacityError> {
        let mut changes = Vec::new();
        let terminate_now = {
            let mut pool = self.pool.lock().await;
            let node = pool
                .nodes
                .get_mut(&id)
                .ok_or(CapacityError::UnknownNode(id))?;
            match node.state {
                NodeState::Assigned => {
                    node.drain_requested = true;
                    return Ok(NodeState::Assigned);
                }
                NodeState::Available => {
                    node.drain_requested = true;
                    node.terminating = true;
                    pool.set_state(id, NodeState::Draining, &mut changes);
                    true
                }
                NodeState::Draining | NodeState::Terminated => {
                    return Ok(node.state);
                }
                NodeState::Provisioning => {
                    return Err(CapacityError::NodeUnavailable(id));
                }
            }
        };

        let state = if terminate_now {
            match self.terminate(id, &mut changes).await {
                Ok(()) => NodeState::Terminated,
                Err(_) => NodeState::Draining,
            }
        } else {
            NodeState::Assigned
        };
        self.publish_changes(None, changes).await;
        Ok(state)
    }

    /// Register a launch that found no capacity.
    ///
    /// Only has an effect when scale-out on demand is enabled; the next pass
    /// raises its target accordingly.
    pub async fn record_demand(&self) {
        if !self.target.scale_out_on_demand {
            return;
        }
        let pending = {
            let mut pool = self.pool.lock().await;
            let headroom = self.target.max - self.target.desired;
            pool.pending_demand = (pool.pending_demand + 1).min(headroom);
            pool.pending_demand
        };
        let event = CapacityEvent::new(
            None,
            CapacityEventPayload::DemandRecorded { pending },
        );
        if let Err(err) = self.events.publish_capacity(event).await {
            tracing::error!("publish capacity event failed: {err}");
        }
    }

    /// Terminate a draining node and retire it.
    ///
    /// The platform call and the pool update run on their own task, so a
    /// caller dropped mid-call never leaves the node marked as terminating.
    async fn terminate(
        &self,
        id: NodeId,
        changes: &mut Vec<NodeChange>,
    ) -> Result<(), CapacityError> {
        let platform = Arc::clone(&self.platform);
        let pool = Arc::clone(&self.pool);
        let cluster = self.cluster_name.clone();

        let task = tokio::spawn(async move {
            let mut changes = Vec::new();
            let result = match platform.terminate_node(id).await {
                Ok(()) => {
                    pool.lock().await.retire(id, &mut changes);
                    Ok(())
                }
                Err(err) => {
                    let reason = err.to_string();
                    tracing::warn!(
                        cluster = %cluster,
                        node = %id,
                        "node termination failed: {reason}"
                    );
                    if let Some(node) = pool.lock().await.nodes.get_mut(&id) {
                        node.terminating = false;
                    }
                    Err(CapacityError::TerminationFailed { node: id, reason })
                }
            };
            (result, changes)
        });

        match task.await {
            Ok((result, mut done)) => {
                changes.append(&mut done);
                result
            }
            Err(err) => {
                if let Some(node) = self.pool.lock().await.nodes.get_mut(&id) {
                    node.terminating = false;
                }
                Err(CapacityError::TerminationFailed {
                    node: id,
                    reason: err.to_string(),
                })
            }
        }
    }

    async fn publish_changes(
        &self,
        pass_id: Option<Uuid>,
        changes: Vec<NodeChange>,
    ) {
        for (node_id, from, to) in changes {
            telemetry::record_node_transition(
                &self.cluster_name,
                node_id,
                from,
                to,
            );
            let event = CapacityEvent::new(
                pass_id,
                CapacityEventPayload::NodeStateChanged { node_id, from, to },
            );
            if let Err(err) = self.events.publish_capacity(event).await {
                tracing::error!("publish capacity event failed: {err}");
            }
        }
    }
}
