//! Runtime integration tests: builder wiring, scheduled firing, one-off runs
//! and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use cadence::*;
use cadence_testkit::{
    RecordingLauncher, RecordingPublisher, ScriptedPlatform, ScriptedRun,
    fast_policy, fast_runtime_config, test_job,
};

fn build_runtime(
    platform: &Arc<ScriptedPlatform>,
    publisher: &RecordingPublisher,
    policy: RetryPolicy,
    target: CapacityTarget,
) -> OrchestratorRuntime<ScriptedPlatform> {
    OrchestratorRuntimeBuilder::new(fast_runtime_config())
        .with_cluster_name("test-cluster")
        .with_platform(platform.clone())
        .with_job(test_job())
        .with_policy(policy)
        .with_schedule(Schedule::every(Duration::from_secs(60)))
        .with_target(target)
        .with_events(Arc::new(publisher.clone()))
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn run_once_drives_a_run_to_success() {
    let platform = Arc::new(ScriptedPlatform::with_script([ScriptedRun::Exit {
        code: 0,
        after_polls: 3,
    }]));
    let publisher = RecordingPublisher::new();
    let runtime = build_runtime(
        &platform,
        &publisher,
        fast_policy(3),
        CapacityTarget::new(1, 1, 2).unwrap(),
    );

    let run = runtime.run_once().await.unwrap();
    runtime.shutdown().await.unwrap();

    assert_eq!(run.state(), RunState::Succeeded);
    assert_eq!(run.attempt_count(), 1);
    assert_eq!(platform.created().len(), 1);
    assert_eq!(runtime.archive().len().await, 1);
    assert_eq!(publisher.transitions_for(run.id()).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn trigger_fires_once_per_period() {
    let platform = Arc::new(ScriptedPlatform::new());
    let publisher = RecordingPublisher::new();
    let runtime = build_runtime(
        &platform,
        &publisher,
        fast_policy(3),
        CapacityTarget::new(1, 1, 2).unwrap(),
    );

    runtime.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(3 * 60 + 30)).await;
    runtime.shutdown().await.unwrap();

    assert_eq!(publisher.scheduled_count(), 3);
    assert_eq!(runtime.trigger().fired(), 3);
    let archived = runtime.archive().recent().await;
    assert_eq!(archived.len(), 3);
    assert!(archived.iter().all(|run| run.state() == RunState::Succeeded));
    assert_eq!(platform.overlapping_starts(), 0);

    tokio::time::sleep(Duration::from_secs(5 * 60)).await;
    assert_eq!(runtime.trigger().fired(), 3);
}

#[tokio::test(start_paused = true)]
async fn slow_run_does_not_delay_later_ticks() {
    let platform = Arc::new(ScriptedPlatform::new());
    platform.set_default(ScriptedRun::Hang);
    let publisher = RecordingPublisher::new();
    let runtime = build_runtime(
        &platform,
        &publisher,
        RetryPolicy::default(),
        CapacityTarget::new(1, 1, 1).unwrap(),
    );

    runtime.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(3 * 60 + 30)).await;

    assert_eq!(publisher.scheduled_count(), 3);
    assert_eq!(runtime.trigger().abandoned(), 0);
    // The first run holds the only node; the second ran out of attempts.
    assert_eq!(platform.starts().len(), 1);
    let archived = runtime.archive().recent().await;
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].state(), RunState::Exhausted);
    assert_eq!(
        archived[0].last_error(),
        Some(ErrorKind::NoCapacityAvailable)
    );

    runtime.shutdown().await.unwrap();
    assert!(runtime.engine().is_closed());
}

#[tokio::test(start_paused = true)]
async fn tick_after_shutdown_is_abandoned() {
    let platform = Arc::new(ScriptedPlatform::new());
    let publisher = RecordingPublisher::new();
    let runtime = build_runtime(
        &platform,
        &publisher,
        fast_policy(3),
        CapacityTarget::new(1, 1, 2).unwrap(),
    );
    runtime.start().await.unwrap();
    runtime.shutdown().await.unwrap();

    assert!(runtime.trigger().on_tick().await.is_none());
    assert_eq!(runtime.trigger().abandoned(), 1);
    assert_eq!(publisher.abandoned_count(), 1);
    assert!(runtime.start().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn reconcile_loop_replaces_lost_capacity() {
    let platform = Arc::new(ScriptedPlatform::new());
    platform.fail_next_creates(1);
    let publisher = RecordingPublisher::new();
    let runtime = build_runtime(
        &platform,
        &publisher,
        fast_policy(3),
        CapacityTarget::new(1, 1, 2).unwrap(),
    );

    runtime.start().await.unwrap();
    assert_eq!(runtime.capacity().live_count().await, 0);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(runtime.capacity().live_count().await, 1);
    assert_eq!(publisher.provisioning_failures(), 1);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn refused_hand_off_abandons_only_that_tick() {
    let launcher = RecordingLauncher::refusing();
    let publisher = RecordingPublisher::new();
    let trigger = ScheduleTrigger::new(
        "rate(1 minute)".parse().unwrap(),
        Arc::new(launcher.clone()),
        Arc::new(publisher.clone()),
    );

    assert!(trigger.on_tick().await.is_none());
    launcher.set_refusing(false);
    let run_id = trigger.on_tick().await.unwrap();

    launcher.assert_hand_off_count_eq(1);
    assert_eq!(launcher.runs()[0].id(), run_id);
    assert_eq!(launcher.runs()[0].state(), RunState::Pending);
    assert_eq!(publisher.scheduled_count(), 2);
    assert_eq!(publisher.abandoned_count(), 1);
}

#[tokio::test]
async fn deployment_defaults_build_a_runtime() {
    let config = DeploymentConfig::default();
    let runtime = OrchestratorRuntimeBuilder::from_deployment(&config)
        .unwrap()
        .with_platform(Arc::new(ScriptedPlatform::new()))
        .with_events(Arc::new(RecordingPublisher::new()))
        .build()
        .unwrap();

    assert_eq!(
        runtime.capacity().cluster_name(),
        "sfn-test-for-scheduled-task-cluster"
    );
    assert_eq!(runtime.job().family(), "hello-world");
    assert_eq!(runtime.capacity().target().desired(), 1);
    assert_eq!(
        runtime.trigger().schedule().period(),
        Duration::from_secs(300)
    );
}

#[tokio::test(start_paused = true)]
async fn repeated_run_once_and_start_spawn_each_loop_once() {
    let platform = Arc::new(ScriptedPlatform::new());
    let publisher = RecordingPublisher::new();
    let runtime = build_runtime(
        &platform,
        &publisher,
        fast_policy(3),
        CapacityTarget::new(1, 1, 2).unwrap(),
    );

    runtime.run_once().await.unwrap();
    runtime.run_once().await.unwrap();
    assert_eq!(runtime.loop_count().await, 1);

    runtime.start().await.unwrap();
    runtime.start().await.unwrap();
    assert_eq!(runtime.loop_count().await, 2);

    runtime.shutdown().await.unwrap();
}
