//! Local runtime example.
//!
//! Runs the hello-world job as a host process every ten seconds, with a
//! pool of one node and the default retry policy, and prints every event
//! until interrupted.
//!
//! ```text
//! cargo run --example local_runtime
//! ```

use std::sync::Arc;

use cadence::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut config = DeploymentConfig::default();
    config.job.command = vec!["echo".into(), "Hello World!".into()];
    config.schedule.expression = "rate(10 seconds)".into();
    config.schedule.fire_on_start = true;

    let bus = Arc::new(InProcEventBus::new(config.runtime.event_capacity));
    let mut runs = bus.subscribe_runs();
    let mut capacity = bus.subscribe_capacity();

    let runtime = OrchestratorRuntimeBuilder::from_deployment(&config)?
        .with_platform(Arc::new(LocalPlatform::new(ProcessMode::Host)))
        .with_events(bus.clone())
        .build()?;
    runtime.start().await?;

    let printer = tokio::spawn(async move {
        loop {
            tokio::select! {
                Ok(event) = runs.recv() => {
                    println!("[RUN] {:?}", event.payload);
                }
                Ok(event) = capacity.recv() => {
                    println!("[CAPACITY] {:?}", event.payload);
                }
                else => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    runtime.shutdown().await?;
    printer.abort();

    for run in runtime.archive().recent().await.iter().take(5) {
        println!(
            "{} {} after {} attempt(s)",
            run.id(),
            run.state(),
            run.attempt_count()
        );
    }
    Ok(())
}
