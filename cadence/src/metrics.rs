//! Prometheus metrics for cadence, behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `cadence_ticks_total` - Trigger ticks fired
//! - `cadence_ticks_abandoned_total` - Ticks whose run could not be handed off
//! - `cadence_run_transitions_total` - Run state transitions
//! - `cadence_runs_terminal_total` - Runs that reached a terminal state
//! - `cadence_attempts_total` - Attempts finished, by outcome
//! - `cadence_node_transitions_total` - Node state transitions
//! - `cadence_provisioning_failures_total` - Failed node creations
//!
//! ## Gauges
//! - `cadence_pool_nodes` - Nodes per state
//!
//! ## Histograms
//! - `cadence_attempt_duration_seconds` - Attempt duration, launch to outcome
#![cfg(feature = "metrics")]

use prometheus::{
    CounterVec, GaugeVec, HistogramVec, Opts, Registry, exponential_buckets,
};
use std::sync::LazyLock;

use crate::capacity::{NodeState, PoolSnapshot};

/// Global Prometheus registry for cadence metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static TICKS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("cadence_ticks_total", "Trigger ticks fired");
    CounterVec::new(opts, &["schedule"])
        .expect("cadence_ticks_total metric creation failed")
});

pub static TICKS_ABANDONED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "cadence_ticks_abandoned_total",
        "Ticks whose run could not be handed off",
    );
    CounterVec::new(opts, &["schedule"])
        .expect("cadence_ticks_abandoned_total metric creation failed")
});

/// Labels: `family`, `from`, `to`.
pub static RUN_TRANSITIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts =
        Opts::new("cadence_run_transitions_total", "Run state transitions");
    CounterVec::new(opts, &["family", "from", "to"])
        .expect("cadence_run_transitions_total metric creation failed")
});

/// Labels: `family`, `state` (succeeded, failed, exhausted).
pub static RUNS_TERMINAL_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "cadence_runs_terminal_total",
        "Runs that reached a terminal state",
    );
    CounterVec::new(opts, &["family", "state"])
        .expect("cadence_runs_terminal_total metric creation failed")
});

pub static ATTEMPTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("cadence_attempts_total", "Attempts finished");
    CounterVec::new(opts, &["family", "outcome"])
        .expect("cadence_attempts_total metric creation failed")
});

pub static NODE_TRANSITIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts =
        Opts::new("cadence_node_transitions_total", "Node state transitions");
    CounterVec::new(opts, &["cluster", "from", "to"])
        .expect("cadence_node_transitions_total metric creation failed")
});

pub static PROVISIONING_FAILURES_TOTAL: LazyLock<CounterVec> =
    LazyLock::new(|| {
        let opts = Opts::new(
            "cadence_provisioning_failures_total",
            "Failed node creations",
        );
        CounterVec::new(opts, &["cluster"])
            .expect("cadence_provisioning_failures_total metric creation failed")
    });

/// Labels: `cluster`, `state`.
pub static POOL_NODES: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("cadence_pool_nodes", "Nodes per state");
    GaugeVec::new(opts, &["cluster", "state"])
        .expect("cadence_pool_nodes metric creation failed")
});

/// Labels: `family`, `outcome` (succeeded or an error kind).
pub static ATTEMPT_DURATION_SECONDS: LazyLock<HistogramVec> =
    LazyLock::new(|| {
        let buckets = exponential_buckets(0.01, 2.0, 16)
            .expect("bucket creation failed");
        let opts = prometheus::HistogramOpts::new(
            "cadence_attempt_duration_seconds",
            "Attempt duration from launch to outcome in seconds",
        )
        .buckets(buckets);
        HistogramVec::new(opts, &["family", "outcome"])
            .expect("cadence_attempt_duration_seconds metric creation failed")
    });

/// Register all metrics with the global registry. Safe to call repeatedly.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(TICKS_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(TICKS_ABANDONED_TOTAL.clone()),
        Box::new(RUN_TRANSITIONS_TOTAL.clone()),
        Box::new(RUNS_TERMINAL_TOTAL.clone()),
        Box::new(ATTEMPTS_TOTAL.clone()),
        Box::new(NODE_TRANSITIONS_TOTAL.clone()),
        Box::new(PROVISIONING_FAILURES_TOTAL.clone()),
        Box::new(POOL_NODES.clone()),
        Box::new(ATTEMPT_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted")
            {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_tick(schedule: &str) {
    TICKS_TOTAL.with_label_values(&[schedule]).inc();
}

pub fn record_tick_abandoned(schedule: &str) {
    TICKS_ABANDONED_TOTAL.with_label_values(&[schedule]).inc();
}

pub fn record_run_transition(family: &str, from: &str, to: &str) {
    RUN_TRANSITIONS_TOTAL
        .with_label_values(&[family, from, to])
        .inc();
}

pub fn record_run_terminal(family: &str, state: &str) {
    RUNS_TERMINAL_TOTAL.with_label_values(&[family, state]).inc();
}

pub fn record_node_transition(cluster: &str, from: &str, to: &str) {
    NODE_TRANSITIONS_TOTAL
        .with_label_values(&[cluster, from, to])
        .inc();
}

pub fn record_provisioning_failed(cluster: &str) {
    PROVISIONING_FAILURES_TOTAL
        .with_label_values(&[cluster])
        .inc();
}

pub fn set_pool_nodes(cluster: &str, state: &str, count: f64) {
    POOL_NODES.with_label_values(&[cluster, state]).set(count);
}

/// Set the per-state node gauges from a pool snapshot.
pub fn set_pool_snapshot(cluster: &str, snapshot: &PoolSnapshot) {
    for (state, count) in [
        (NodeState::Provisioning, snapshot.provisioning),
        (NodeState::Available, snapshot.available),
        (NodeState::Assigned, snapshot.assigned),
        (NodeState::Draining, snapshot.draining),
    ] {
        set_pool_nodes(cluster, state.as_str(), count as f64);
    }
}

/// Count a finished attempt and observe its duration.
pub fn observe_attempt_duration(family: &str, outcome: &str, duration_secs: f64) {
    ATTEMPTS_TOTAL.with_label_values(&[family, outcome]).inc();
    ATTEMPT_DURATION_SECONDS
        .with_label_values(&[family, outcome])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
