mod cli;
mod shutdown;

use std::time::Duration;

use dswarm_core::ManagerIdentity;
use dswarm_engine::{ManagerConfig, ManagerRuntime};

use crate::cli::Cli;
use crate::shutdown::{ShutdownController, ShutdownEvent, spawn_ctrl_c_handler};
use clap::Parser;

async fn bind_runtime(cli: &Cli, config: ManagerConfig, identity: ManagerIdentity) -> anyhow::Result<ManagerRuntime> {
    if let Some(port) = cli.port {
        return Ok(ManagerRuntime::bind(("0.0.0.0", port), config, identity).await?);
    }

    if cli.low_port > cli.high_port {
        anyhow::bail!("--low-port must be <= --high-port");
    }

    for port in cli.low_port..=cli.high_port {
        match ManagerRuntime::bind(("0.0.0.0", port), config.clone(), identity.clone()).await {
            Ok(runtime) => return Ok(runtime),
            Err(_) => continue,
        }
    }

    anyhow::bail!("no free port in {}..={}", cli.low_port, cli.high_port)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let identity = ManagerIdentity::from_env(cli.name.clone());

    let mut config = ManagerConfig {
        wait_for_workers: cli.wait_for_workers,
        ..ManagerConfig::default()
    };
    if let Some(host) = cli.catalog_host.clone() {
        config.catalog_hosts = vec![(host, cli.catalog_port)];
    }

    // DS_BANDWIDTH is exported for worker children to rate-limit transfers
    // against (spec §6); the coordinator itself never moves task data.
    if cli.bandwidth > 0 {
        // SAFETY-equivalent note: single-threaded startup, before any other
        // task reads the environment.
        unsafe { std::env::set_var("DS_BANDWIDTH", cli.bandwidth.to_string()) };
    }
    unsafe { std::env::set_var("DS_NAME", &identity.project) };
    if let Some(host) = &cli.catalog_host {
        unsafe { std::env::set_var("CATALOG_HOST", host) };
        unsafe { std::env::set_var("CATALOG_PORT", cli.catalog_port.to_string()) };
    }

    let mut runtime = bind_runtime(&cli, config, identity.clone()).await?;
    tracing::info!(
        project = %identity.project,
        port = runtime.local_port(),
        "dswarm-manager listening"
    );

    let shutdown = std::sync::Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown.clone(), shutdown_tx);

    let mut draining = false;
    loop {
        if draining && runtime.workers_connected() == 0 {
            tracing::info!("drain complete, exiting");
            break;
        }

        tokio::select! {
            ev = shutdown_rx.recv() => {
                match ev {
                    Some(ShutdownEvent::Graceful) => {
                        tracing::info!("graceful shutdown requested, draining connected workers");
                        draining = true;
                        runtime.begin_drain();
                    }
                    Some(ShutdownEvent::Immediate) => {
                        tracing::warn!("immediate shutdown requested, exiting now");
                        break;
                    }
                    None => {}
                }
            }
            done = runtime.wait(None, Duration::from_secs(1)) => {
                if let Some(task) = done {
                    tracing::info!(taskid = task.taskid, "task retrieved");
                }
            }
        }
    }

    Ok(())
}
