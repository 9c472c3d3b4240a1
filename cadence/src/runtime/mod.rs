/// Runtime builder for constructing orchestrator instances.
pub mod builder;
/// Runtime supervisor owning the trigger and reconcile loops.
pub mod supervisor;

pub use builder::OrchestratorRuntimeBuilder;
pub use supervisor::{
    OrchestratorRuntime, OrchestratorRuntimeConfig, ShutdownToken,
};
