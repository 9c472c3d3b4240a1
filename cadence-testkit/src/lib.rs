//! Test doubles for cadence.
//!
//! [`ScriptedPlatform`] stands in for the execution platform with per-call
//! scripted behavior, [`RecordingPublisher`] and [`RecordingLauncher`]
//! capture what the orchestrator emits, and the `job` module holds shared
//! fixtures.

pub mod job;
pub mod mock;
pub mod platform;

pub use job::*;
pub use mock::*;
pub use platform::*;
