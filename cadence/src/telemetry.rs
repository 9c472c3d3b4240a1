//! Tracing and telemetry instrumentation for cadence.
//!
//! Helpers for creating tracing spans and recording metrics across the run
//! and node lifecycles. All functions work both with and without the
//! `metrics` feature flag; without it they only log.
//!
//! # Example
//!
//! ```ignore
//! use cadence::telemetry::{run_span, record_run_transition};
//!
//! let span = run_span(run.id(), job.family());
//! let _enter = span.enter();
//! record_run_transition(job.family(), &transition);
//! ```

use std::future::Future;
use tracing::instrument::Instrumented;
use tracing::{Instrument, Span, info_span};

use crate::capacity::{NodeId, NodeState, PoolSnapshot};
use crate::run::{RunState, Transition};

/// Span covering a workflow run from hand-off to terminal state.
#[must_use]
pub fn run_span(run_id: impl ToString, family: impl AsRef<str>) -> Span {
    info_span!(
        "cadence.run",
        run_id = %run_id.to_string(),
        family = %family.as_ref(),
    )
}

/// Span covering one launch-and-poll attempt of a run.
#[must_use]
pub fn attempt_span(run_id: impl ToString, attempt: u32) -> Span {
    info_span!(
        "cadence.attempt",
        run_id = %run_id.to_string(),
        attempt = attempt,
    )
}

/// Span covering one capacity reconcile pass.
#[must_use]
pub fn reconcile_span(cluster: impl AsRef<str>) -> Span {
    info_span!("cadence.reconcile", cluster = %cluster.as_ref())
}

/// Span covering one trigger tick.
#[must_use]
pub fn tick_span(schedule: impl AsRef<str>) -> Span {
    info_span!("cadence.tick", schedule = %schedule.as_ref())
}

/// Attach a run span to a future.
pub fn instrument_run<F>(
    run_id: impl ToString,
    family: impl AsRef<str>,
    future: F,
) -> Instrumented<F>
where
    F: Future,
{
    future.instrument(run_span(run_id, family))
}

pub fn record_tick(schedule: impl AsRef<str>) {
    tracing::debug!(schedule = %schedule.as_ref(), "trigger fired");

    #[cfg(feature = "metrics")]
    crate::metrics::record_tick(schedule.as_ref());
}

/// Record a tick whose run could not be handed off.
pub fn record_tick_abandoned(
    schedule: impl AsRef<str>,
    run_id: impl ToString,
    reason: impl AsRef<str>,
) {
    tracing::error!(
        schedule = %schedule.as_ref(),
        run_id = %run_id.to_string(),
        reason = %reason.as_ref(),
        "tick abandoned"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_tick_abandoned(schedule.as_ref());
}

/// Log a run state change and count it.
pub fn record_run_transition(family: impl AsRef<str>, transition: &Transition) {
    let error_kind = transition.error_kind.map(|k| k.as_str()).unwrap_or("-");
    match (transition.to, error_kind) {
        (RunState::Failed | RunState::Exhausted, _) => tracing::error!(
            run_id = %transition.run_id,
            from = %transition.from,
            to = %transition.to,
            attempt = transition.attempt_count,
            error_kind,
            "run transitioned"
        ),
        (RunState::Running, kind) if kind != "-" => tracing::warn!(
            run_id = %transition.run_id,
            from = %transition.from,
            to = %transition.to,
            attempt = transition.attempt_count,
            error_kind,
            "run retrying"
        ),
        _ => tracing::info!(
            run_id = %transition.run_id,
            from = %transition.from,
            to = %transition.to,
            attempt = transition.attempt_count,
            "run transitioned"
        ),
    }

    #[cfg(feature = "metrics")]
    {
        crate::metrics::record_run_transition(
            family.as_ref(),
            transition.from.as_str(),
            transition.to.as_str(),
        );
        if transition.to.is_terminal() {
            crate::metrics::record_run_terminal(
                family.as_ref(),
                transition.to.as_str(),
            );
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = family;
}

/// Log a node state change and count it.
pub fn record_node_transition(
    cluster: impl AsRef<str>,
    node_id: NodeId,
    from: Option<NodeState>,
    to: NodeState,
) {
    let from = from.map(|s| s.as_str()).unwrap_or("new");
    tracing::info!(
        cluster = %cluster.as_ref(),
        node_id = %node_id,
        from,
        to = %to,
        "node transitioned"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_node_transition(cluster.as_ref(), from, to.as_str());
}

pub fn record_provisioning_failed(
    cluster: impl AsRef<str>,
    node_id: NodeId,
    reason: impl AsRef<str>,
) {
    tracing::error!(
        cluster = %cluster.as_ref(),
        node_id = %node_id,
        reason = %reason.as_ref(),
        "node provisioning failed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_provisioning_failed(cluster.as_ref());
}

/// Update the nodes-per-state gauges from a pool snapshot.
pub fn set_pool_gauges(cluster: impl AsRef<str>, snapshot: &PoolSnapshot) {
    tracing::debug!(
        cluster = %cluster.as_ref(),
        provisioning = snapshot.provisioning,
        available = snapshot.available,
        assigned = snapshot.assigned,
        draining = snapshot.draining,
        "pool updated"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::set_pool_snapshot(cluster.as_ref(), snapshot);
}

/// Start timing an attempt; pass the handle to [`record_attempt_end`].
pub fn record_attempt_start(run_id: impl ToString, attempt: u32) -> AttemptTimer {
    AttemptTimer {
        run_id: run_id.to_string(),
        attempt,
        start: std::time::Instant::now(),
    }
}

/// Finish timing an attempt and observe its duration.
///
/// `outcome` is `succeeded` or the error kind name of the failed attempt.
pub fn record_attempt_end(
    timer: AttemptTimer,
    family: impl AsRef<str>,
    outcome: impl AsRef<str>,
) {
    let duration_secs = timer.start.elapsed().as_secs_f64();
    tracing::info!(
        run_id = %timer.run_id,
        attempt = timer.attempt,
        family = %family.as_ref(),
        outcome = %outcome.as_ref(),
        duration_secs,
        "attempt finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_attempt_duration(
        family.as_ref(),
        outcome.as_ref(),
        duration_secs,
    );
}

/// Opaque handle returned by [`record_attempt_start`].
#[derive(Debug)]
pub struct AttemptTimer {
    run_id: String,
    attempt: u32,
    start: std::time::Instant,
}

impl AttemptTimer {
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
