use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

use crate::error::ScheduleError;
use crate::events::{EventPublisher, RunEvent, RunEventPayload};
use crate::job::RunId;
use crate::run::WorkflowRun;
use crate::runtime::ShutdownToken;
use crate::telemetry;
use crate::workflow::RunLauncher;

/// A fixed-rate schedule written as `rate(<n> <unit>)`.
///
/// Units are second, minute, hour and day. The singular form is required
/// when `n == 1` and the plural form otherwise, so `rate(1 minute)` and
/// `rate(5 minutes)` parse while `rate(5 minute)` does not.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Schedule {
    expression: String,
    period: Duration,
}

impl Schedule {
    /// A schedule firing every `period`, rounded down to whole seconds
    /// (minimum one).
    pub fn every(period: Duration) -> Self {
        let secs = period.as_secs().max(1);
        let unit = if secs == 1 { "second" } else { "seconds" };
        Self {
            expression: format!("rate({secs} {unit})"),
            period: Duration::from_secs(secs),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ScheduleError {
            expression: s.to_string(),
            reason: reason.to_string(),
        };

        let body = s
            .trim()
            .strip_prefix("rate(")
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| invalid("expected rate(<value> <unit>)"))?;

        let mut parts = body.split_whitespace();
        let (Some(value), Some(unit), None) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid("expected a value and a unit"));
        };

        let value: u64 = value
            .parse()
            .map_err(|_| invalid("value must be a positive integer"))?;
        if value == 0 {
            return Err(invalid("value must be a positive integer"));
        }

        let (unit_secs, singular) = match unit {
            "second" => (1, true),
            "seconds" => (1, false),
            "minute" => (60, true),
            "minutes" => (60, false),
            "hour" => (3600, true),
            "hours" => (3600, false),
            "day" => (86_400, true),
            "days" => (86_400, false),
            _ => return Err(invalid("unit must be second, minute, hour or day")),
        };
        if singular != (value == 1) {
            return Err(invalid("use the singular unit only with a value of 1"));
        }

        let secs = value
            .checked_mul(unit_secs)
            .ok_or_else(|| invalid("period overflows"))?;

        Ok(Self {
            expression: format!("rate({value} {unit})"),
            period: Duration::from_secs(secs),
        })
    }
}

impl TryFrom<String> for Schedule {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Schedule> for String {
    fn from(schedule: Schedule) -> Self {
        schedule.expression
    }
}

impl Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Fires one new run per tick and hands it to the launcher.
///
/// Ticks never wait for earlier runs. A failed hand-off abandons only that
/// tick; the next one proceeds normally.
pub struct ScheduleTrigger {
    schedule: Schedule,
    fire_on_start: bool,
    launcher: Arc<dyn RunLauncher>,
    events: Arc<dyn EventPublisher>,
    fired: AtomicU64,
    abandoned: AtomicU64,
}

impl std::fmt::Debug for ScheduleTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleTrigger")
            .field("schedule", &self.schedule.expression)
            .field("fire_on_start", &self.fire_on_start)
            .field("fired", &self.fired.load(Ordering::Relaxed))
            .field("abandoned", &self.abandoned.load(Ordering::Relaxed))
            .finish()
    }
}

impl ScheduleTrigger {
    pub fn new(
        schedule: Schedule,
        launcher: Arc<dyn RunLauncher>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            schedule,
            fire_on_start: false,
            launcher,
            events,
            fired: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        }
    }

    /// Fire the first tick immediately instead of one period after start.
    pub fn with_fire_on_start(mut self, fire_on_start: bool) -> Self {
        self.fire_on_start = fire_on_start;
        self
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Ticks fired so far, abandoned ones included.
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }

    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    /// Create a `Pending` run and hand it off without waiting on it.
    ///
    /// Returns the run id when the hand-off was accepted.
    pub async fn on_tick(&self) -> Option<RunId> {
        let run = WorkflowRun::new();
        let run_id = run.id();
        let span = telemetry::tick_span(self.schedule.expression());

        async {
            self.fired.fetch_add(1, Ordering::Relaxed);
            telemetry::record_tick(self.schedule.expression());
            self.publish(RunEvent::for_run(
                run_id,
                "scheduled",
                RunEventPayload::Scheduled { run_id },
            ))
            .await;

            match self.launcher.hand_off(run).await {
                Ok(()) => Some(run_id),
                Err(err) => {
                    let reason = err.to_string();
                    self.abandoned.fetch_add(1, Ordering::Relaxed);
                    telemetry::record_tick_abandoned(
                        self.schedule.expression(),
                        run_id,
                        &reason,
                    );
                    self.publish(RunEvent::for_run(
                        run_id,
                        "abandoned",
                        RunEventPayload::TickAbandoned { run_id, reason },
                    ))
                    .await;
                    None
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Tick until shutdown. Missed ticks are skipped, never bursted.
    pub async fn run(&self, shutdown: ShutdownToken) {
        let period = self.schedule.period();
        let start = if self.fire_on_start {
            Instant::now()
        } else {
            Instant::now() + period
        };
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            schedule = %self.schedule,
            fire_on_start = self.fire_on_start,
            "trigger started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Trigger shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.on_tick().await;
                }
            }
        }
    }

    async fn publish(&self, event: RunEvent) {
        if let Err(err) = self.events.publish_run(event).await {
            tracing::error!("publish run event failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventStream, InProcEventBus};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct CollectingLauncher {
        runs: Mutex<Vec<WorkflowRun>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl RunLauncher for CollectingLauncher {
        async fn hand_off(&self, run: WorkflowRun) -> anyhow::Result<()> {
            if self.closed.load(Ordering::SeqCst) {
                anyhow::bail!("engine closed");
            }
            self.runs.lock().push(run);
            Ok(())
        }
    }

    fn trigger(
        schedule: &str,
    ) -> (ScheduleTrigger, Arc<CollectingLauncher>, Arc<InProcEventBus>) {
        let launcher = Arc::new(CollectingLauncher::default());
        let bus = Arc::new(InProcEventBus::new(64));
        let trigger = ScheduleTrigger::new(
            schedule.parse().unwrap(),
            launcher.clone(),
            bus.clone(),
        );
        (trigger, launcher, bus)
    }

    #[test]
    fn test_parse_rate_expressions() {
        let schedule: Schedule = "rate(5 minutes)".parse().unwrap();
        assert_eq!(schedule.period(), Duration::from_secs(300));
        assert_eq!(schedule.to_string(), "rate(5 minutes)");

        assert_eq!(
            "rate(1 hour)".parse::<Schedule>().unwrap().period(),
            Duration::from_secs(3600)
        );
        assert_eq!(
            "rate(2 days)".parse::<Schedule>().unwrap().period(),
            Duration::from_secs(172_800)
        );
        assert_eq!(
            " rate(30 seconds) ".parse::<Schedule>().unwrap().period(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_reject_malformed_expressions() {
        for bad in [
            "rate(5 minute)",
            "rate(1 minutes)",
            "rate(0 minutes)",
            "rate(-1 minutes)",
            "rate(5 weeks)",
            "rate(5)",
            "cron(0 12 * * ? *)",
            "rate(5 minutes",
        ] {
            assert!(bad.parse::<Schedule>().is_err(), "{bad} should not parse");
        }
    }

    #[tokio::test]
    async fn test_on_tick_hands_off_pending_run() {
        let (trigger, launcher, bus) = trigger("rate(5 minutes)");
        let mut rx = bus.subscribe_runs();

        let run_id = trigger.on_tick().await.expect("hand-off accepted");

        let runs = launcher.runs.lock();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id(), run_id);
        assert_eq!(runs[0].state(), crate::run::RunState::Pending);

        let event = rx.try_recv().unwrap();
        assert!(matches!(event.payload, RunEventPayload::Scheduled { .. }));
    }

    #[tokio::test]
    async fn test_failed_hand_off_abandons_only_that_tick() {
        let (trigger, launcher, bus) = trigger("rate(1 minute)");
        let mut rx = bus.subscribe_runs();

        launcher.closed.store(true, Ordering::SeqCst);
        assert!(trigger.on_tick().await.is_none());
        assert_eq!(trigger.abandoned(), 1);

        launcher.closed.store(false, Ordering::SeqCst);
        assert!(trigger.on_tick().await.is_some());
        assert_eq!(trigger.fired(), 2);
        assert_eq!(launcher.runs.lock().len(), 1);

        let _scheduled = rx.try_recv().unwrap();
        let abandoned = rx.try_recv().unwrap();
        assert!(matches!(
            abandoned.payload,
            RunEventPayload::TickAbandoned { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_fires_once_per_period_until_shutdown() {
        let (trigger, launcher, _) = trigger("rate(5 minutes)");
        let trigger = Arc::new(trigger);
        let shutdown = ShutdownToken::new();

        let handle = tokio::spawn({
            let trigger = trigger.clone();
            let shutdown = shutdown.clone();
            async move { trigger.run(shutdown).await }
        });

        tokio::time::sleep(Duration::from_secs(4 * 60)).await;
        assert_eq!(launcher.runs.lock().len(), 0);

        tokio::time::sleep(Duration::from_secs(12 * 60)).await;
        assert_eq!(launcher.runs.lock().len(), 3);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_on_start_ticks_immediately() {
        let (trigger, launcher, _) = trigger("rate(1 hour)");
        let trigger = Arc::new(trigger.with_fire_on_start(true));
        let shutdown = ShutdownToken::new();

        let handle = tokio::spawn({
            let trigger = trigger.clone();
            let shutdown = shutdown.clone();
            async move { trigger.run(shutdown).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(launcher.runs.lock().len(), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
