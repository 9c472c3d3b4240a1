use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;
use uuid::Uuid;

/// Where a job's output lines are delivered and for how long they are kept.
///
/// The sink itself is an external collaborator; the core only carries the
/// identifier through to the platform.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LogDestination {
    /// Opaque sink identifier, e.g. a log stream prefix.
    pub stream_prefix: String,
    /// How long the sink should retain output.
    pub retention: Duration,
}

/// Immutable description of the unit of work launched on every run.
///
/// Created once at deploy time and shared read-only (behind an `Arc`) by all
/// concurrently executing runs.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    family: String,
    image: String,
    memory_limit_mib: u32,
    command: Vec<String>,
    log_destination: LogDestination,
}

impl JobDefinition {
    /// Create a job definition. Validation happens in the config layer.
    pub fn new(
        family: impl Into<String>,
        image: impl Into<String>,
        memory_limit_mib: u32,
        command: Vec<String>,
        log_destination: LogDestination,
    ) -> Self {
        Self {
            family: family.into(),
            image: image.into(),
            memory_limit_mib,
            command,
            log_destination,
        }
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn memory_limit_mib(&self) -> u32 {
        self.memory_limit_mib
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn log_destination(&self) -> &LogDestination {
        &self.log_destination
    }
}

/// Unique identifier of a workflow run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared failure taxonomy.
///
/// Every backend maps its platform-specific failures into one of these kinds
/// at the task executor boundary; retry policies match against them.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
pub enum ErrorKind {
    /// No node in the pool was `Available` at launch time.
    NoCapacityAvailable,
    /// The platform refused to start the process.
    LaunchRejected,
    /// The attempt did not finish within the configured attempt timeout.
    Timeout,
    /// The process exited with a non-zero status.
    NonZeroExit,
    /// The process was killed for exceeding its memory limit.
    OutOfMemory,
    /// The process was terminated by a signal or crashed.
    Crashed,
    /// The platform no longer knows about the process or its node.
    NodeLost,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::NoCapacityAvailable,
        ErrorKind::LaunchRejected,
        ErrorKind::Timeout,
        ErrorKind::NonZeroExit,
        ErrorKind::OutOfMemory,
        ErrorKind::Crashed,
        ErrorKind::NodeLost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NoCapacityAvailable => "NoCapacityAvailable",
            ErrorKind::LaunchRejected => "LaunchRejected",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::NonZeroExit => "NonZeroExit",
            ErrorKind::OutOfMemory => "OutOfMemory",
            ErrorKind::Crashed => "Crashed",
            ErrorKind::NodeLost => "NodeLost",
        }
    }

    /// Parse a kind from its canonical name, as used in configuration.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_names_round_trip() {
        for kind in ErrorKind::ALL {
            assert_eq!(ErrorKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::from_name("States.ALL"), None);
    }

    #[test]
    fn test_run_ids_are_unique() {
        let first = RunId::new();
        let second = RunId::new();
        assert_ne!(first, second);
        assert_eq!(first.as_uuid().get_version_num(), 7);
    }
}
