use cadence::*;
use std::sync::Arc;
use std::time::Duration;

/// Family name used by every fixture job.
pub const TEST_FAMILY: &str = "hello-world";

/// The hello-world job the default deployment describes.
pub fn test_job() -> Arc<JobDefinition> {
    Arc::new(JobDefinition::new(
        TEST_FAMILY,
        "hello-world:latest",
        512,
        vec!["/hello".to_string()],
        LogDestination {
            stream_prefix: TEST_FAMILY.to_string(),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        },
    ))
}

/// Retry policy with the default retryable kinds and no backoff.
pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        [
            ErrorKind::NoCapacityAvailable,
            ErrorKind::LaunchRejected,
            ErrorKind::Timeout,
        ],
        max_attempts,
        Duration::ZERO,
    )
}

/// Pool target that accepts a scale-in immediately.
pub fn eager_target(min: usize, desired: usize, max: usize) -> CapacityTarget {
    CapacityTarget::new(min, desired, max)
        .map(|target| target.with_scale_in_idle(Duration::ZERO))
        .unwrap_or_else(|err| panic!("invalid fixture target: {err}"))
}

/// Runtime configuration with short loop intervals for tests.
pub fn fast_runtime_config() -> OrchestratorRuntimeConfig {
    OrchestratorRuntimeConfig {
        poll_interval_ms: 10,
        reconcile_interval_ms: 50,
        shutdown_grace_secs: 5,
        event_capacity: 256,
    }
}
