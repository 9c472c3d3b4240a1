use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};

use crate::archive::RunArchive;
use crate::capacity::CapacityManager;
use crate::error::ConfigError;
use crate::executor::TaskExecutor;
use crate::job::JobDefinition;
use crate::platform::ExecutionPlatform;
use crate::run::WorkflowRun;
use crate::trigger::ScheduleTrigger;
use crate::workflow::WorkflowEngine;

/// Configuration for the orchestrator runtime.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorRuntimeConfig {
    /// Interval between status polls of a running attempt.
    pub poll_interval_ms: u64,
    /// Interval between capacity reconcile passes.
    pub reconcile_interval_ms: u64,
    /// How long shutdown waits for in-flight runs.
    pub shutdown_grace_secs: u64,
    /// Buffer size of the in-process event bus.
    pub event_capacity: usize,
}

impl Default for OrchestratorRuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            reconcile_interval_ms: 10_000,
            shutdown_grace_secs: 30,
            event_capacity: 1024,
        }
    }
}

impl OrchestratorRuntimeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "runtime.poll_interval_ms must be positive".into(),
            ));
        }
        if self.reconcile_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "runtime.reconcile_interval_ms must be positive".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "runtime.event_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Token for signaling graceful shutdown to background loops.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        // Register before checking the flag so a concurrent cancel is not missed.
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Wires the capacity manager, executor, engine and trigger together and
/// owns their background loops.
pub struct OrchestratorRuntime<P: ExecutionPlatform + 'static> {
    config: OrchestratorRuntimeConfig,
    job: Arc<JobDefinition>,
    capacity: Arc<CapacityManager<P>>,
    executor: Arc<TaskExecutor<P>>,
    engine: Arc<WorkflowEngine<P>>,
    trigger: Arc<ScheduleTrigger>,
    shutdown_token: ShutdownToken,
    loop_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    reconciler_started: AtomicBool,
    trigger_started: AtomicBool,
}

impl<P: ExecutionPlatform + 'static> fmt::Debug for OrchestratorRuntime<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let loop_count = self
            .loop_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("OrchestratorRuntime")
            .field("config", &self.config)
            .field("platform_type", &type_name::<P>())
            .field("family", &self.job.family())
            .field("cluster", &self.capacity.cluster_name())
            .field("schedule", &self.trigger.schedule().expression())
            .field("loop_count", &loop_count)
            .field(
                "reconciler_started",
                &self.reconciler_started.load(Ordering::SeqCst),
            )
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl<P: ExecutionPlatform + 'static> OrchestratorRuntime<P> {
    pub(crate) fn new(
        config: OrchestratorRuntimeConfig,
        job: Arc<JobDefinition>,
        capacity: Arc<CapacityManager<P>>,
        executor: Arc<TaskExecutor<P>>,
        engine: Arc<WorkflowEngine<P>>,
        trigger: Arc<ScheduleTrigger>,
    ) -> Self {
        Self {
            config,
            job,
            capacity,
            executor,
            engine,
            trigger,
            shutdown_token: ShutdownToken::new(),
            loop_handles: Mutex::new(Vec::new()),
            reconciler_started: AtomicBool::new(false),
            trigger_started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &OrchestratorRuntimeConfig {
        &self.config
    }

    pub fn job(&self) -> Arc<JobDefinition> {
        Arc::clone(&self.job)
    }

    pub fn capacity(&self) -> Arc<CapacityManager<P>> {
        Arc::clone(&self.capacity)
    }

    pub fn executor(&self) -> Arc<TaskExecutor<P>> {
        Arc::clone(&self.executor)
    }

    pub fn engine(&self) -> Arc<WorkflowEngine<P>> {
        Arc::clone(&self.engine)
    }

    pub fn trigger(&self) -> Arc<ScheduleTrigger> {
        Arc::clone(&self.trigger)
    }

    pub fn archive(&self) -> &RunArchive {
        self.engine.archive()
    }

    /// Background loops spawned so far.
    pub async fn loop_count(&self) -> usize {
        self.loop_handles.lock().await.len()
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Run an initial capacity pass, then spawn the reconcile and trigger
    /// loops.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.shutdown_token.is_cancelled() {
            anyhow::bail!("runtime already shut down");
        }
        self.initial_capacity_pass().await;
        self.spawn_reconciler().await;
        self.spawn_trigger().await;
        Ok(())
    }

    /// Drive a single run to its terminal state, outside the schedule.
    ///
    /// Keeps the reconcile loop running while the run is in flight.
    pub async fn run_once(&self) -> anyhow::Result<WorkflowRun> {
        if self.shutdown_token.is_cancelled() {
            anyhow::bail!("runtime already shut down");
        }
        self.initial_capacity_pass().await;
        self.spawn_reconciler().await;
        Ok(self.engine.execute(WorkflowRun::new()).await)
    }

    /// Stop the loops, refuse new hand-offs, and wait for in-flight runs up
    /// to the configured grace period.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("Initiating graceful shutdown of orchestrator runtime");

        self.shutdown_token.cancel();
        self.engine.close();

        let handles = {
            let mut guard = self.loop_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Loop task failed: {:?}", e),
                Err(_) => tracing::warn!("Loop task timed out during shutdown"),
            }
        }

        let unfinished = self.engine.drain(self.config.shutdown_grace()).await;
        tracing::info!(unfinished, "Orchestrator runtime shutdown complete");
        Ok(())
    }

    async fn initial_capacity_pass(&self) {
        let report = self.capacity.ensure_capacity().await;
        for err in &report.errors {
            tracing::warn!("initial capacity pass: {err}");
        }
        tracing::info!(
            cluster = %self.capacity.cluster_name(),
            target = report.target,
            provisioned = report.provisioned.len(),
            "initial capacity pass complete"
        );
    }

    /// Spawn the reconcile loop unless an earlier `start` or `run_once`
    /// already did.
    async fn spawn_reconciler(&self) {
        if self.reconciler_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let capacity = self.capacity();
        let interval = self.config.reconcile_interval();
        let shutdown = self.shutdown_token.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Reconciler shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let report = capacity.ensure_capacity().await;
                        for err in &report.errors {
                            tracing::warn!("reconcile pass: {err}");
                        }
                    }
                }
            }
        });

        self.loop_handles.lock().await.push(handle);
    }

    async fn spawn_trigger(&self) {
        if self.trigger_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let trigger = self.trigger();
        let shutdown = self.shutdown_token.clone();
        let handle = tokio::spawn(async move { trigger.run(shutdown).await });
        self.loop_handles.lock().await.push(handle);
    }
}
