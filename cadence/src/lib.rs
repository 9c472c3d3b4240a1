//! Cadence - scheduled workflow orchestration with bounded retries.
//!
//! Fires a containerized job on a fixed schedule, runs each execution on a
//! node drawn from an elastic worker pool, and drives it to a terminal state
//! under a bounded retry policy.
//!
//! # Core Concepts
//!
//! - **Trigger**: [`ScheduleTrigger`] fires once per [`Schedule`] period and
//!   hands a fresh [`WorkflowRun`] to the engine. Ticks never wait on each
//!   other.
//!
//! - **Workflow Engine**: [`WorkflowEngine`] launches, polls and retries a
//!   run per its [`RetryPolicy`] until it is `Succeeded`, `Failed` or
//!   `Exhausted`.
//!
//! - **Task Executor**: [`TaskExecutor`] borrows one node per attempt, starts
//!   the process and maps platform status into the [`ErrorKind`] taxonomy.
//!
//! - **Capacity Manager**: [`CapacityManager`] keeps the pool within
//!   `[min, max]` and never scales in a node that holds an assignment.
//!
//! - **Platform**: [`ExecutionPlatform`] is the four-operation seam to the
//!   infrastructure; [`LocalPlatform`] runs jobs as local processes.
//!
//! - **Runtime**: [`OrchestratorRuntime`] wires everything together and owns
//!   the background loops.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use cadence::*;
//! use std::sync::Arc;
//!
//! let config = DeploymentConfig::load_or_default(None)?;
//! let events = Arc::new(InProcEventBus::new(config.runtime.event_capacity));
//! let runtime = OrchestratorRuntimeBuilder::from_deployment(&config)?
//!     .with_platform(Arc::new(LocalPlatform::new(ProcessMode::Host)))
//!     .with_events(events)
//!     .build()?;
//! runtime.start().await?;
//! ```

/// Bounded store of terminal runs.
pub mod archive;

/// Worker node pool management.
///
/// The `capacity` module provides [`CapacityManager`], which provisions and
/// drains nodes towards a [`CapacityTarget`] and hands out exclusive
/// assignments.
pub mod capacity;

/// Deployment configuration loaded from TOML.
pub mod config;

/// Typed domain errors.
pub mod error;

/// Event publishing and subscription system.
///
/// The `events` module provides:
/// - [`EventPublisher`] and [`EventStream`] for pub/sub
/// - [`RunEvent`] and [`CapacityEvent`] with their payloads
/// - [`InProcEventBus`] for in-process broadcasting
pub mod events;

/// Launching attempts and polling their outcomes.
pub mod executor;

/// Job definition, run identifiers and the shared error taxonomy.
pub mod job;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

/// Execution platform seam and the local process backend.
pub mod platform;

/// Retry policy evaluation.
pub mod retry;

/// Workflow run state machine.
pub mod run;

/// Runtime orchestration.
///
/// The `runtime` module provides:
/// - [`OrchestratorRuntime`] - main runtime type
/// - [`OrchestratorRuntimeConfig`] - runtime configuration
/// - [`ShutdownToken`] - graceful shutdown signaling
/// - [`OrchestratorRuntimeBuilder`] - dependency-checked construction
pub mod runtime;

/// Tracing spans and instrumentation helpers.
pub mod telemetry;

/// Schedules and the recurring trigger.
pub mod trigger;

/// Workflow engine driving runs through retries.
pub mod workflow;

pub use archive::*;
pub use capacity::*;
pub use config::*;
pub use error::*;
pub use events::*;
pub use executor::*;
pub use job::*;
pub use platform::*;
pub use retry::*;
pub use run::*;
pub use runtime::{
    OrchestratorRuntime, OrchestratorRuntimeBuilder, OrchestratorRuntimeConfig,
    ShutdownToken,
};
pub use trigger::*;
pub use workflow::*;
