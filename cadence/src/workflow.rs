use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::archive::RunArchive;
use crate::error::TaskError;
use crate::events::{EventPublisher, RunEvent, RunEventPayload};
use crate::executor::{ExitInfo, Outcome, OutcomeHandle, TaskExecutor};
use crate::job::{ErrorKind, JobDefinition};
use crate::platform::ExecutionPlatform;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::run::{RunState, WorkflowRun};
use crate::telemetry;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Accepts freshly scheduled runs.
///
/// The trigger only sees this seam, so it never depends on how runs are
/// executed.
#[async_trait]
pub trait RunLauncher: Send + Sync {
    /// Take ownership of a `Pending` run and start driving it. Must return
    /// without waiting for the run to progress.
    async fn hand_off(&self, run: WorkflowRun) -> anyhow::Result<()>;
}

struct EngineInner<P: ExecutionPlatform> {
    job: Arc<JobDefinition>,
    policy: Arc<RetryPolicy>,
    executor: Arc<TaskExecutor<P>>,
    events: Arc<dyn EventPublisher>,
    archive: RunArchive,
    poll_interval: Duration,
}

/// Drives each run through launch, poll and retry to a terminal state.
///
/// Every handed-off run gets its own task. Backoff sleeps suspend only that
/// run; runs never wait on each other.
pub struct WorkflowEngine<P: ExecutionPlatform> {
    inner: Arc<EngineInner<P>>,
    closed: AtomicBool,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: ExecutionPlatform> std::fmt::Debug for WorkflowEngine<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("family", &self.inner.job.family())
            .field("policy", &self.inner.policy)
            .field("poll_interval", &self.inner.poll_interval)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<P: ExecutionPlatform + 'static> WorkflowEngine<P> {
    pub fn new(
        job: Arc<JobDefinition>,
        policy: RetryPolicy,
        executor: Arc<TaskExecutor<P>>,
        events: Arc<dyn EventPublisher>,
        archive: RunArchive,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                job,
                policy: Arc::new(policy),
                executor,
                events,
                archive,
                poll_interval: DEFAULT_POLL_INTERVAL,
            }),
            closed: AtomicBool::new(false),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    /// Set the interval between status polls of a running attempt.
    ///
    /// Must be called before the engine is shared.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.poll_interval = interval;
        }
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    pub fn archive(&self) -> &RunArchive {
        &self.inner.archive
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting hand-offs. Runs already in flight continue.
    pub fn close(&self) {
        let _handles = self.in_flight.lock();
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Runs handed off and not yet terminal.
    pub fn in_flight(&self) -> usize {
        let mut handles = self.in_flight.lock();
        handles.retain(|h| !h.is_finished());
        handles.len()
    }

    /// Drive a run to completion on the caller's task.
    pub async fn execute(&self, run: WorkflowRun) -> WorkflowRun {
        let run_id = run.id();
        telemetry::instrument_run(
            run_id,
            self.inner.job.family(),
            self.inner.clone().drive(run),
        )
        .await
    }

    /// Wait up to `grace` for in-flight runs; returns how many were still
    /// running when the grace period ran out.
    pub async fn drain(&self, grace: Duration) -> usize {
        let handles = std::mem::take(&mut *self.in_flight.lock());
        let deadline = tokio::time::Instant::now() + grace;
        let mut unfinished = 0;

        for handle in handles {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!("workflow run task failed: {err}");
                }
                Err(_) => unfinished += 1,
            }
        }

        if unfinished > 0 {
            tracing::warn!(unfinished, "runs still in flight after shutdown grace");
        }
        unfinished
    }
}

#[async_trait]
impl<P: ExecutionPlatform + 'static> RunLauncher for WorkflowEngine<P> {
    async fn hand_off(&self, run: WorkflowRun) -> anyhow::Result<()> {
        if self.is_closed() {
            anyhow::bail!("workflow engine is closed");
        }
        if run.state() != RunState::Pending {
            anyhow::bail!("run {} is {}, expected pending", run.id(), run.state());
        }

        // Checked again under the lock so `drain` cannot miss a run that is
        // spawned while the engine closes.
        let mut handles = self.in_flight.lock();
        if self.is_closed() {
            anyhow::bail!("workflow engine is closed");
        }

        let run_id = run.id();
        let inner = self.inner.clone();
        let handle = tokio::spawn(telemetry::instrument_run(
            run_id,
            self.inner.job.family(),
            async move {
                inner.drive(run).await;
            },
        ));
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        Ok(())
    }
}

impl<P: ExecutionPlatform + 'static> EngineInner<P> {
    async fn drive(self: Arc<Self>, mut run: WorkflowRun) -> WorkflowRun {
        loop {
            let attempt = match run.begin_attempt() {
                Ok(attempt) => attempt,
                Err(err) => {
                    tracing::error!("cannot start attempt: {err}");
                    break;
                }
            };
            if run.state() == RunState::Pending {
                self.transition(&mut run, RunState::Running, None).await;
            }

            let result = self.attempt(&run, attempt).await;
            let kind = match result {
                Ok(_) => {
                    self.transition(&mut run, RunState::Succeeded, None).await;
                    break;
                }
                Err(err) => {
                    tracing::debug!(attempt, "attempt failed: {err}");
                    err.kind()
                }
            };

            match self.policy.decide(kind, attempt) {
                RetryDecision::Retry { after } => {
                    self.transition(&mut run, RunState::Running, Some(kind))
                        .await;
                    tokio::time::sleep(after).await;
                }
                RetryDecision::Fail => {
                    self.transition(&mut run, RunState::Failed, Some(kind))
                        .await;
                    break;
                }
                RetryDecision::Exhaust => {
                    self.transition(&mut run, RunState::Exhausted, Some(kind))
                        .await;
                    break;
                }
            }
        }

        self.archive.insert(run.clone()).await;
        run
    }

    async fn attempt(
        &self,
        run: &WorkflowRun,
        attempt: u32,
    ) -> Result<ExitInfo, TaskError> {
        let span = telemetry::attempt_span(run.id(), attempt);
        async {
            let timer = telemetry::record_attempt_start(run.id(), attempt);
            let result = self.launch_and_wait().await;
            let outcome = match &result {
                Ok(_) => "succeeded",
                Err(err) => err.kind().as_str(),
            };
            telemetry::record_attempt_end(timer, self.job.family(), outcome);
            result
        }
        .instrument(span)
        .await
    }

    async fn launch_and_wait(&self) -> Result<ExitInfo, TaskError> {
        let handle = self.executor.launch_on_pool(&self.job).await?;

        let Some(limit) = self.policy.attempt_timeout() else {
            return self.wait_for_outcome(&handle).await;
        };
        match tokio::time::timeout(limit, self.wait_for_outcome(&handle)).await {
            Ok(result) => result,
            // The attempt may have ended while its node was being released;
            // that outcome stands.
            Err(_) => match self.executor.abandon(&handle).await {
                Some(Outcome::Succeeded(info)) => Ok(info),
                Some(Outcome::Failed { kind, detail }) => {
                    Err(TaskError::ExecutionFailed { kind, detail })
                }
                Some(Outcome::Running) | None => Err(TaskError::ExecutionFailed {
                    kind: ErrorKind::Timeout,
                    detail: format!("attempt exceeded {}s", limit.as_secs_f64()),
                }),
            },
        }
    }

    async fn wait_for_outcome(
        &self,
        handle: &OutcomeHandle,
    ) -> Result<ExitInfo, TaskError> {
        loop {
            match self.executor.poll(handle).await {
                Outcome::Running => tokio::time::sleep(self.poll_interval).await,
                Outcome::Succeeded(info) => return Ok(info),
                Outcome::Failed { kind, detail } => {
                    return Err(TaskError::ExecutionFailed { kind, detail });
                }
            }
        }
    }

    async fn transition(
        &self,
        run: &mut WorkflowRun,
        to: RunState,
        error_kind: Option<ErrorKind>,
    ) {
        let transition = match run.transition(to, error_kind) {
            Ok(transition) => transition,
            Err(err) => {
                tracing::error!("{err}");
                return;
            }
        };
        telemetry::record_run_transition(self.job.family(), &transition);

        // Position in the history keeps keys distinct when a retry re-enters
        // the same state on the same attempt.
        let key = format!("{}-{}", transition.to, run.history().len());
        let event = RunEvent::for_run(
            run.id(),
            &key,
            RunEventPayload::Transitioned(transition),
        );
        if let Err(err) = self.events.publish_run(event).await {
            tracing::error!(run_id = %run.id(), "publish run event failed: {err}");
        }
    }
}
