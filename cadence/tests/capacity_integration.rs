//! Capacity manager behavior under launches, drains and platform failures.

use std::sync::Arc;
use std::time::Duration;

use cadence::*;
use cadence_testkit::{
    RecordingPublisher, ScriptedPlatform, ScriptedRun, eager_target, test_job,
};

fn manager(
    platform: &Arc<ScriptedPlatform>,
    publisher: &RecordingPublisher,
    target: CapacityTarget,
) -> Arc<CapacityManager<ScriptedPlatform>> {
    Arc::new(CapacityManager::new(
        "sfn-test-for-scheduled-task-cluster",
        target,
        platform.clone(),
        Arc::new(publisher.clone()),
    ))
}

fn assert_never_terminated_while_assigned(publisher: &RecordingPublisher) {
    for (node, from, to) in publisher.node_changes() {
        assert!(
            !(from == Some(NodeState::Assigned) && to == NodeState::Terminated),
            "node {node} went from assigned straight to terminated"
        );
    }
}

#[tokio::test]
async fn busy_sole_node_makes_reconcile_a_noop() {
    let platform = Arc::new(ScriptedPlatform::new());
    platform.set_default(ScriptedRun::Hang);
    let publisher = RecordingPublisher::new();
    let capacity = manager(
        &platform,
        &publisher,
        CapacityTarget::new(1, 1, 2).unwrap(),
    );
    capacity.ensure_capacity().await;
    let executor = TaskExecutor::new(platform.clone(), capacity.clone());

    let handle = executor.launch_on_pool(&test_job()).await.unwrap();
    let node = capacity.node(handle.node_id).await.unwrap();
    assert_eq!(node.state, NodeState::Assigned);
    assert!(node.scale_in_protected);

    let passes = futures::future::join_all(
        (0..4).map(|_| capacity.ensure_capacity()),
    )
    .await;

    assert!(passes.iter().all(|report| report.is_noop()));
    assert_eq!(capacity.live_count().await, 1);
    assert_eq!(platform.created().len(), 1);
    assert!(platform.terminated().is_empty());
    assert_eq!(
        capacity.node(handle.node_id).await.unwrap().state,
        NodeState::Assigned
    );
}

#[tokio::test]
async fn concurrent_launches_never_share_a_node() {
    let platform = Arc::new(ScriptedPlatform::new());
    platform.set_default(ScriptedRun::Hang);
    let publisher = RecordingPublisher::new();
    let capacity = manager(
        &platform,
        &publisher,
        CapacityTarget::new(1, 3, 3).unwrap(),
    );
    capacity.ensure_capacity().await;
    let executor = Arc::new(TaskExecutor::new(platform.clone(), capacity.clone()));
    let job = test_job();

    let launches = futures::future::join_all((0..6).map(|_| {
        let executor = executor.clone();
        let job = job.clone();
        tokio::spawn(async move { executor.launch_on_pool(&job).await })
    }))
    .await;

    let mut nodes = Vec::new();
    let mut refused = 0;
    for launch in launches {
        match launch.unwrap() {
            Ok(handle) => nodes.push(handle.node_id),
            Err(TaskError::NoCapacityAvailable) => refused += 1,
            Err(other) => panic!("unexpected launch error: {other}"),
        }
    }
    nodes.sort();
    nodes.dedup();
    assert_eq!(nodes.len(), 3);
    assert_eq!(refused, 3);
    assert_eq!(platform.overlapping_starts(), 0);
}

#[tokio::test]
async fn scale_in_skips_assigned_nodes() {
    let platform = Arc::new(ScriptedPlatform::new());
    platform.set_default(ScriptedRun::Hang);
    let publisher = RecordingPublisher::new();
    let capacity = manager(
        &platform,
        &publisher,
        eager_target(1, 1, 3).with_scale_out_on_demand(true),
    );
    capacity.ensure_capacity().await;
    let executor = TaskExecutor::new(platform.clone(), capacity.clone());
    let job = test_job();

    let first = executor.launch_on_pool(&job).await.unwrap();
    assert!(matches!(
        executor.launch_on_pool(&job).await,
        Err(TaskError::NoCapacityAvailable)
    ));
    capacity.ensure_capacity().await;
    let second = executor.launch_on_pool(&job).await.unwrap();
    assert_eq!(capacity.live_count().await, 2);

    // Demand is spent, so the target is back at one; both nodes are busy.
    let report = capacity.ensure_capacity().await;
    assert_eq!(report.target, 1);
    assert!(report.terminated.is_empty());
    assert_eq!(capacity.snapshot().await.assigned, 2);

    capacity.release(second.node_id).await.unwrap();
    let report = capacity.ensure_capacity().await;
    assert_eq!(report.terminated, vec![second.node_id]);
    assert_eq!(
        capacity.node(first.node_id).await.unwrap().state,
        NodeState::Assigned
    );
    assert_never_terminated_while_assigned(&publisher);
}

#[tokio::test]
async fn provisioning_failure_is_retried_on_next_pass() {
    let platform = Arc::new(ScriptedPlatform::new());
    platform.fail_next_creates(1);
    let publisher = RecordingPublisher::new();
    let capacity = manager(
        &platform,
        &publisher,
        CapacityTarget::new(1, 2, 2).unwrap(),
    );

    let first = capacity.ensure_capacity().await;
    assert_eq!(first.provisioned.len(), 1);
    assert_eq!(first.errors.len(), 1);
    assert!(matches!(
        first.errors[0],
        CapacityError::ProvisioningFailed { .. }
    ));
    assert_eq!(capacity.live_count().await, 1);
    assert_eq!(publisher.provisioning_failures(), 1);

    let second = capacity.ensure_capacity().await;
    assert_eq!(second.provisioned.len(), 1);
    assert!(second.errors.is_empty());
    assert_eq!(capacity.live_count().await, 2);
}

#[tokio::test]
async fn drained_node_terminates_only_after_its_run_ends() {
    let platform = Arc::new(ScriptedPlatform::with_script([ScriptedRun::Exit {
        code: 0,
        after_polls: 1,
    }]));
    let publisher = RecordingPublisher::new();
    let capacity = manager(
        &platform,
        &publisher,
        CapacityTarget::new(1, 1, 1).unwrap(),
    );
    capacity.ensure_capacity().await;
    let executor = TaskExecutor::new(platform.clone(), capacity.clone());

    let handle = executor.launch_on_pool(&test_job()).await.unwrap();
    assert_eq!(
        capacity.drain(handle.node_id).await.unwrap(),
        NodeState::Assigned
    );
    assert!(platform.terminated().is_empty());

    assert_eq!(executor.poll(&handle).await, Outcome::Running);
    assert!(matches!(
        executor.poll(&handle).await,
        Outcome::Succeeded(_)
    ));

    assert_eq!(platform.terminated(), vec![handle.node_id]);
    assert_eq!(
        capacity.node(handle.node_id).await.unwrap().state,
        NodeState::Terminated
    );
    assert_never_terminated_while_assigned(&publisher);

    // The replacement comes from the next pass.
    let report = capacity.ensure_capacity().await;
    assert_eq!(report.provisioned.len(), 1);
}

#[tokio::test]
async fn failed_termination_keeps_node_draining_until_next_pass() {
    let platform = Arc::new(ScriptedPlatform::new());
    let publisher = RecordingPublisher::new();
    let capacity = manager(
        &platform,
        &publisher,
        eager_target(1, 1, 2).with_scale_out_on_demand(true),
    );
    capacity.ensure_capacity().await;
    capacity.assign_any().await.unwrap();
    capacity.record_demand().await;
    capacity.ensure_capacity().await;
    assert_eq!(capacity.live_count().await, 2);

    // Both idle now; one is above target.
    for node in capacity.nodes().await {
        if node.state == NodeState::Assigned {
            capacity.release(node.id).await.unwrap();
        }
    }
    platform.set_fail_terminates(true);
    let report = capacity.ensure_capacity().await;
    assert!(report.terminated.is_empty());
    assert!(matches!(
        report.errors.as_slice(),
        [CapacityError::TerminationFailed { .. }]
    ));
    assert_eq!(capacity.snapshot().await.draining, 1);

    platform.set_fail_terminates(false);
    let report = capacity.ensure_capacity().await;
    assert_eq!(report.terminated.len(), 1);
    assert_eq!(capacity.live_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn reconcile_passes_are_single_flight() {
    let platform = Arc::new(ScriptedPlatform::new());
    platform.set_create_delay(Duration::from_secs(5));
    let publisher = RecordingPublisher::new();
    let capacity = manager(
        &platform,
        &publisher,
        CapacityTarget::new(2, 2, 4).unwrap(),
    );

    let (a, b) = tokio::join!(capacity.ensure_capacity(), capacity.ensure_capacity());

    assert_eq!(a.provisioned.len() + b.provisioned.len(), 2);
    assert_eq!(platform.created().len(), 2);
    assert_eq!(capacity.live_count().await, 2);
}

#[tokio::test(start_paused = true)]
async fn interrupted_drain_still_retires_the_node() {
    let platform = Arc::new(ScriptedPlatform::new());
    platform.set_terminate_delay(Duration::from_secs(60));
    let publisher = RecordingPublisher::new();
    let capacity = manager(&platform, &publisher, eager_target(1, 1, 2));
    capacity.ensure_capacity().await;
    let node = capacity.nodes().await[0].id;

    let interrupted =
        tokio::time::timeout(Duration::from_secs(1), capacity.drain(node)).await;
    assert!(interrupted.is_err());

    // Termination is still in flight; a pass neither repeats it nor
    // provisions past the draining node.
    let report = capacity.ensure_capacity().await;
    assert!(report.is_noop(), "{report:?}");
    assert_eq!(capacity.snapshot().await.draining, 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(
        capacity.node(node).await.unwrap().state,
        NodeState::Terminated
    );
    assert_eq!(platform.terminated(), vec![node]);

    let report = capacity.ensure_capacity().await;
    assert_eq!(report.provisioned.len(), 1);
    assert_eq!(capacity.snapshot().await.available, 1);
}

#[tokio::test]
async fn publish_failures_do_not_stop_capacity_work() {
    let platform = Arc::new(ScriptedPlatform::new());
    platform.fail_next_creates(1);
    let publisher = RecordingPublisher::new();
    publisher.set_failing(true);
    let capacity = manager(
        &platform,
        &publisher,
        eager_target(1, 1, 2).with_scale_out_on_demand(true),
    );

    let report = capacity.ensure_capacity().await;
    assert!(matches!(
        report.errors.as_slice(),
        [CapacityError::ProvisioningFailed { .. }]
    ));
    capacity.record_demand().await;

    let report = capacity.ensure_capacity().await;
    assert_eq!(report.target, 2);
    assert_eq!(report.provisioned.len(), 2);
    // Each publish failed, yet every event was still handed over.
    assert_eq!(publisher.provisioning_failures(), 1);
    assert!(publisher.capacity_events().iter().any(|e| matches!(
        e.payload,
        CapacityEventPayload::DemandRecorded { pending: 1 }
    )));
}
