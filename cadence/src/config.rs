//! Deployment configuration loaded once at startup from TOML.
//!
//! Every field has a default, so a partial file (or none at all) describes
//! the stock deployment: an `alpine` container echoing `Hello World!` every
//! five minutes on a pool of one to two nodes.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::capacity::CapacityTarget;
use crate::error::ConfigError;
use crate::job::{ErrorKind, JobDefinition, LogDestination};
use crate::retry::RetryPolicy;
use crate::runtime::OrchestratorRuntimeConfig;
use crate::trigger::Schedule;

pub const ENV_SSH_ALLOWED_IP: &str = "CADENCE_SSH_ALLOWED_IP";
pub const ENV_SSH_KEY_NAME: &str = "CADENCE_SSH_KEY_NAME";

/// Top-level deployment configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Identifier of the worker pool, handed to the capacity manager.
    pub cluster_name: String,
    pub job: JobConfig,
    pub retry: RetryConfig,
    pub capacity: CapacityConfig,
    pub schedule: ScheduleConfig,
    pub admin_access: AdminAccess,
    pub runtime: OrchestratorRuntimeConfig,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            cluster_name: "sfn-test-for-scheduled-task-cluster".to_string(),
            job: JobConfig::default(),
            retry: RetryConfig::default(),
            capacity: CapacityConfig::default(),
            schedule: ScheduleConfig::default(),
            admin_access: AdminAccess::default(),
            runtime: OrchestratorRuntimeConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub family: String,
    pub image: String,
    pub memory_limit_mib: u32,
    pub command: Vec<String>,
    pub log_stream_prefix: String,
    pub log_retention_days: u32,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            family: "hello-world".to_string(),
            image: "alpine".to_string(),
            memory_limit_mib: 32,
            command: vec!["echo".to_string(), "Hello World!".to_string()],
            log_stream_prefix: "sfn-test-for-scheduled-task/hello-world"
                .to_string(),
            log_retention_days: 3,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Error kind names to retry; `"*"` stands for every kind.
    pub retryable: Vec<String>,
    pub max_attempts: u32,
    pub backoff_secs: u64,
    pub attempt_timeout_secs: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            retryable: policy
                .retryable_kinds()
                .iter()
                .map(|kind| kind.as_str().to_string())
                .collect(),
            max_attempts: policy.max_attempts(),
            backoff_secs: policy.backoff().as_secs(),
            attempt_timeout_secs: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    pub min: usize,
    pub desired: usize,
    pub max: usize,
    pub scale_out_on_demand: bool,
    pub scale_in_idle_secs: u64,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            min: 1,
            desired: 1,
            max: 2,
            scale_out_on_demand: false,
            scale_in_idle_secs: 300,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub expression: String,
    pub fire_on_start: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            expression: "rate(5 minutes)".to_string(),
            fire_on_start: false,
        }
    }
}

/// Operator access settings. Passed through to the platform layer as-is.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminAccess {
    pub ssh_allowed_ip: Option<String>,
    pub ssh_key_name: Option<String>,
}

impl DeploymentConfig {
    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path` when given, otherwise start from the defaults, then apply
    /// environment overrides.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `CADENCE_*` overrides from `lookup`. Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(ip) = lookup(ENV_SSH_ALLOWED_IP).filter(|v| !v.is_empty()) {
            self.admin_access.ssh_allowed_ip = Some(ip);
        }
        if let Some(key) = lookup(ENV_SSH_KEY_NAME).filter(|v| !v.is_empty()) {
            self.admin_access.ssh_key_name = Some(key);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster_name.trim().is_empty() {
            return Err(ConfigError::Invalid("cluster_name is empty".into()));
        }
        if self.job.family.trim().is_empty() {
            return Err(ConfigError::Invalid("job.family is empty".into()));
        }
        if self.job.image.trim().is_empty() {
            return Err(ConfigError::Invalid("job.image is empty".into()));
        }
        if self.job.memory_limit_mib == 0 {
            return Err(ConfigError::Invalid(
                "job.memory_limit_mib must be positive".into(),
            ));
        }
        if self.job.command.is_empty() {
            return Err(ConfigError::Invalid("job.command is empty".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.attempt_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "retry.attempt_timeout_secs must be positive".into(),
            ));
        }
        self.retryable_kinds()?;
        self.capacity_target()?;
        self.schedule()?;
        self.runtime.validate()?;
        Ok(())
    }

    pub fn job_definition(&self) -> JobDefinition {
        JobDefinition::new(
            self.job.family.clone(),
            self.job.image.clone(),
            self.job.memory_limit_mib,
            self.job.command.clone(),
            LogDestination {
                stream_prefix: self.job.log_stream_prefix.clone(),
                retention: Duration::from_secs(
                    u64::from(self.job.log_retention_days) * 86_400,
                ),
            },
        )
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        let policy = RetryPolicy::new(
            self.retryable_kinds()?,
            self.retry.max_attempts,
            Duration::from_secs(self.retry.backoff_secs),
        );
        Ok(match self.retry.attempt_timeout_secs {
            Some(secs) => policy.with_attempt_timeout(Duration::from_secs(secs)),
            None => policy,
        })
    }

    pub fn capacity_target(&self) -> Result<CapacityTarget, ConfigError> {
        let target = CapacityTarget::new(
            self.capacity.min,
            self.capacity.desired,
            self.capacity.max,
        )
        .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        Ok(target
            .with_scale_out_on_demand(self.capacity.scale_out_on_demand)
            .with_scale_in_idle(Duration::from_secs(
                self.capacity.scale_in_idle_secs,
            )))
    }

    pub fn schedule(&self) -> Result<Schedule, ConfigError> {
        Ok(self.schedule.expression.parse()?)
    }

    fn retryable_kinds(&self) -> Result<Vec<ErrorKind>, ConfigError> {
        let mut kinds = Vec::new();
        for name in &self.retry.retryable {
            if name == "*" {
                kinds.extend(ErrorKind::ALL);
                continue;
            }
            let kind = ErrorKind::from_name(name).ok_or_else(|| {
                ConfigError::Invalid(format!("unknown retry error kind {name:?}"))
            })?;
            kinds.push(kind);
        }
        Ok(kinds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_describe_stock_deployment() {
        let config = DeploymentConfig::default();
        config.validate().unwrap();

        let job = config.job_definition();
        assert_eq!(job.family(), "hello-world");
        assert_eq!(job.image(), "alpine");
        assert_eq!(job.memory_limit_mib(), 32);
        assert_eq!(job.command(), ["echo", "Hello World!"]);
        assert_eq!(
            job.log_destination().retention,
            Duration::from_secs(3 * 86_400)
        );

        let target = config.capacity_target().unwrap();
        assert_eq!((target.min(), target.desired(), target.max()), (1, 1, 2));
        assert_eq!(
            config.schedule().unwrap().period(),
            Duration::from_secs(300)
        );
        assert_eq!(config.retry_policy().unwrap(), RetryPolicy::default());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: DeploymentConfig = toml::from_str(
            r#"
            cluster_name = "batch"

            [retry]
            retryable = ["*"]
            max_attempts = 5
            attempt_timeout_secs = 600

            [schedule]
            expression = "rate(1 hour)"
            fire_on_start = true
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.cluster_name, "batch");
        assert_eq!(config.job.image, "alpine");
        let policy = config.retry_policy().unwrap();
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.retryable_kinds().len(), ErrorKind::ALL.len());
        assert_eq!(policy.attempt_timeout(), Some(Duration::from_secs(600)));
        assert!(config.schedule.fire_on_start);
        assert_eq!(config.capacity.max, 2);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = DeploymentConfig::default();
        config.job.memory_limit_mib = 0;
        assert!(config.validate().is_err());

        let mut config = DeploymentConfig::default();
        config.capacity.desired = 3;
        assert!(config.validate().is_err());

        let mut config = DeploymentConfig::default();
        config.retry.retryable = vec!["States.ALL".into()];
        assert!(config.validate().is_err());

        let mut config = DeploymentConfig::default();
        config.schedule.expression = "rate(5 minute)".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Schedule(_))
        ));

        let mut config = DeploymentConfig::default();
        config.job.command.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut config: DeploymentConfig = toml::from_str(
            r#"
            [admin_access]
            ssh_allowed_ip = "10.0.0.1/32"
            ssh_key_name = "file-key"
            "#,
        )
        .unwrap();

        config.apply_overrides(|key| match key {
            ENV_SSH_ALLOWED_IP => Some("203.0.113.7/32".to_string()),
            ENV_SSH_KEY_NAME => Some(String::new()),
            _ => None,
        });

        assert_eq!(
            config.admin_access.ssh_allowed_ip.as_deref(),
            Some("203.0.113.7/32")
        );
        assert_eq!(config.admin_access.ssh_key_name.as_deref(), Some("file-key"));
    }

    #[test]
    fn test_load_reports_missing_file() {
        let err = DeploymentConfig::load("/nonexistent/cadence.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
