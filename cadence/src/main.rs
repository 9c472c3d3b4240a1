//! Cadence daemon - runs the scheduled job against local processes.
//!
//! Loads the deployment configuration, provisions the pool, then fires the
//! job on its schedule until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cadence::{
    DeploymentConfig, InProcEventBus, LocalPlatform, OrchestratorRuntimeBuilder,
    ProcessMode, RunState,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    /// Run the command directly on the host
    Host,
    /// Run the image through a container CLI
    Container,
}

/// Cadence CLI
#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Scheduled job runner with bounded retries", long_about = None)]
#[command(version)]
struct Cli {
    /// Deployment configuration file (TOML)
    #[arg(short, long, env = "CADENCE_CONFIG")]
    config: Option<PathBuf>,

    /// Address range allowed to reach worker nodes over SSH
    #[arg(long)]
    ssh_allowed_ip: Option<String>,

    /// Key pair name installed on worker nodes
    #[arg(long)]
    ssh_key_name: Option<String>,

    /// How job processes are started
    #[arg(long, value_enum, default_value_t = Mode::Host)]
    mode: Mode,

    /// Container CLI used in container mode
    #[arg(long, default_value = "docker")]
    container_binary: String,

    /// Log level
    #[arg(long, env = "CADENCE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, env = "CADENCE_LOG_JSON")]
    json: bool,

    /// Fire a single run, wait for it, and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());

    if cli.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let mut config = DeploymentConfig::load_or_default(cli.config.as_deref())
        .context("loading deployment configuration")?;
    if let Some(ip) = cli.ssh_allowed_ip {
        config.admin_access.ssh_allowed_ip = Some(ip);
    }
    if let Some(key) = cli.ssh_key_name {
        config.admin_access.ssh_key_name = Some(key);
    }

    tracing::info!(
        cluster = %config.cluster_name,
        family = %config.job.family,
        schedule = %config.schedule.expression,
        ssh_allowed_ip = config.admin_access.ssh_allowed_ip.as_deref().unwrap_or("-"),
        ssh_key_name = config.admin_access.ssh_key_name.as_deref().unwrap_or("-"),
        "configuration loaded"
    );

    #[cfg(feature = "metrics")]
    cadence::metrics::init_metrics()?;

    let mode = match cli.mode {
        Mode::Host => ProcessMode::Host,
        Mode::Container => ProcessMode::Container {
            binary: cli.container_binary,
        },
    };
    let events = Arc::new(InProcEventBus::new(config.runtime.event_capacity));
    let runtime = OrchestratorRuntimeBuilder::from_deployment(&config)?
        .with_platform(Arc::new(LocalPlatform::new(mode)))
        .with_events(events)
        .build()?;

    if cli.once {
        let run = runtime.run_once().await?;
        runtime.shutdown().await?;
        tracing::info!(
            run_id = %run.id(),
            state = %run.state(),
            attempts = run.attempt_count(),
            "run finished"
        );
        if run.state() != RunState::Succeeded {
            anyhow::bail!("run {} ended {}", run.id(), run.state());
        }
        return Ok(());
    }

    runtime.start().await?;
    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    tracing::info!("interrupt received");
    runtime.shutdown().await
}
