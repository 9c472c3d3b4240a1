use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::archive::RunArchive;
use crate::capacity::{CapacityManager, CapacityTarget};
use crate::config::DeploymentConfig;
use crate::error::ConfigError;
use crate::events::EventPublisher;
use crate::executor::TaskExecutor;
use crate::job::JobDefinition;
use crate::platform::ExecutionPlatform;
use crate::retry::RetryPolicy;
use crate::trigger::{Schedule, ScheduleTrigger};
use crate::workflow::{RunLauncher, WorkflowEngine};

use super::supervisor::{OrchestratorRuntime, OrchestratorRuntimeConfig};

/// Builder for constructing an `OrchestratorRuntime` with explicit dependencies.
///
/// `build()` fails when a required dependency is missing. The retry policy
/// defaults to [`RetryPolicy::default`] and the archive to an empty one.
///
/// # Example
///
/// ```ignore
/// use cadence::*;
///
/// let config = DeploymentConfig::load_or_default(None)?;
/// let runtime = OrchestratorRuntimeBuilder::from_deployment(&config)?
///     .with_platform(Arc::new(LocalPlatform::new(ProcessMode::Host)))
///     .with_events(Arc::new(InProcEventBus::new(1024)))
///     .build()?;
/// runtime.start().await?;
/// ```
pub struct OrchestratorRuntimeBuilder<P: ExecutionPlatform + 'static> {
    config: OrchestratorRuntimeConfig,
    cluster_name: Option<String>,
    platform: Option<Arc<P>>,
    job: Option<Arc<JobDefinition>>,
    policy: RetryPolicy,
    schedule: Option<Schedule>,
    fire_on_start: bool,
    target: Option<CapacityTarget>,
    events: Option<Arc<dyn EventPublisher>>,
    archive: Option<RunArchive>,
}

impl<P: ExecutionPlatform + 'static> fmt::Debug for OrchestratorRuntimeBuilder<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("OrchestratorRuntimeBuilder");
        debug.field("config", &self.config);
        debug.field("cluster_name", &self.cluster_name);
        debug.field("platform_set", &self.platform.is_some());
        debug.field("job_set", &self.job.is_some());
        debug.field("schedule", &self.schedule);
        debug.field("target", &self.target);
        debug.field("events_set", &self.events.is_some());

        if self.platform.is_some() {
            debug.field("platform_type", &type_name::<P>());
        }

        debug.finish()
    }
}

impl<P: ExecutionPlatform + 'static> OrchestratorRuntimeBuilder<P> {
    pub fn new(config: OrchestratorRuntimeConfig) -> Self {
        Self {
            config,
            cluster_name: None,
            platform: None,
            job: None,
            policy: RetryPolicy::default(),
            schedule: None,
            fire_on_start: false,
            target: None,
            events: None,
            archive: None,
        }
    }

    /// Pre-populate everything a deployment file describes. The platform and
    /// event publisher still have to be supplied.
    pub fn from_deployment(config: &DeploymentConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(config.runtime.clone())
            .with_cluster_name(config.cluster_name.clone())
            .with_job(Arc::new(config.job_definition()))
            .with_policy(config.retry_policy()?)
            .with_schedule(config.schedule()?)
            .with_fire_on_start(config.schedule.fire_on_start)
            .with_target(config.capacity_target()?))
    }

    pub fn with_cluster_name(mut self, cluster_name: impl Into<String>) -> Self {
        self.cluster_name = Some(cluster_name.into());
        self
    }

    pub fn with_platform(mut self, platform: Arc<P>) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn with_job(mut self, job: Arc<JobDefinition>) -> Self {
        self.job = Some(job);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_fire_on_start(mut self, fire_on_start: bool) -> Self {
        self.fire_on_start = fire_on_start;
        self
    }

    pub fn with_target(mut self, target: CapacityTarget) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_archive(mut self, archive: RunArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Build the runtime, ensuring all required dependencies are present.
    pub fn build(self) -> anyhow::Result<OrchestratorRuntime<P>> {
        let cluster_name = self
            .cluster_name
            .ok_or_else(|| anyhow::anyhow!("cluster name missing"))?;
        let platform = self
            .platform
            .ok_or_else(|| anyhow::anyhow!("platform dependency missing"))?;
        let job = self
            .job
            .ok_or_else(|| anyhow::anyhow!("job definition missing"))?;
        let schedule = self
            .schedule
            .ok_or_else(|| anyhow::anyhow!("schedule missing"))?;
        let target = self
            .target
            .ok_or_else(|| anyhow::anyhow!("capacity target missing"))?;
        let events = self
            .events
            .ok_or_else(|| anyhow::anyhow!("events dependency missing"))?;
        self.config.validate()?;

        let capacity = Arc::new(CapacityManager::new(
            cluster_name,
            target,
            platform.clone(),
            events.clone(),
        ));
        let executor = Arc::new(TaskExecutor::new(platform, capacity.clone()));
        let engine = Arc::new(
            WorkflowEngine::new(
                job.clone(),
                self.policy,
                executor.clone(),
                events.clone(),
                self.archive.unwrap_or_default(),
            )
            .with_poll_interval(self.config.poll_interval()),
        );
        let launcher: Arc<dyn RunLauncher> = engine.clone();
        let trigger = Arc::new(
            ScheduleTrigger::new(schedule, launcher, events)
                .with_fire_on_start(self.fire_on_start),
        );

        Ok(OrchestratorRuntime::new(
            self.config,
            job,
            capacity,
            executor,
            engine,
            trigger,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InProcEventBus;
    use crate::platform::{LocalPlatform, ProcessMode};

    #[test]
    fn test_build_requires_platform() {
        let config = DeploymentConfig::default();
        let err = OrchestratorRuntimeBuilder::<LocalPlatform>::from_deployment(&config)
            .unwrap()
            .with_events(Arc::new(InProcEventBus::new(8)))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("platform dependency missing"));
    }

    #[test]
    fn test_build_requires_events() {
        let config = DeploymentConfig::default();
        let err = OrchestratorRuntimeBuilder::from_deployment(&config)
            .unwrap()
            .with_platform(Arc::new(LocalPlatform::new(ProcessMode::Host)))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("events dependency missing"));
    }

    #[test]
    fn test_from_deployment_rejects_invalid_config() {
        let mut config = DeploymentConfig::default();
        config.capacity.min = 3;
        assert!(
            OrchestratorRuntimeBuilder::<LocalPlatform>::from_deployment(&config)
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_build_wires_components() {
        let config = DeploymentConfig::default();
        let runtime = OrchestratorRuntimeBuilder::from_deployment(&config)
            .unwrap()
            .with_platform(Arc::new(LocalPlatform::new(ProcessMode::Host)))
            .with_events(Arc::new(InProcEventBus::new(8)))
            .build()
            .unwrap();

        assert_eq!(runtime.capacity().cluster_name(), config.cluster_name);
        assert_eq!(runtime.trigger().schedule().expression(), "rate(5 minutes)");
        assert_eq!(runtime.engine().policy(), &RetryPolicy::default());
        let debug_str = format!("{runtime:?}");
        assert!(debug_str.contains("LocalPlatform"));
    }
}
