mod cli;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use shepherd::config::{DEFAULT_CONFIG_PATH, DaemonConfig};
use shepherd::daemon::{Daemon, handlers, restore, signals};
use shepherd::driver::ProcessDriver;
use shepherd::reexec::Registry;

fn main() {
    // A re-executed Monitor Process never reaches the daemon's CLI.
    match Registry::builtin() {
        Ok(registry) => {
            if registry.init() {
                return;
            }
        }
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    }

    shepherd::logging::init("daemon");

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("FATAL: Failed to create Tokio runtime: {e}");
            eprintln!("The daemon cannot start without an async runtime.");
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(real_main()) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn real_main() -> Result<()> {
    let args = cli::Args::parse();

    match args.sub.unwrap_or(cli::Cmd::Run { config: None }) {
        cli::Cmd::Run { config } => run_daemon(config).await,
        cli::Cmd::Status { config } => handle_status(config),
    }
}

fn config_path(config: Option<String>) -> PathBuf {
    config.map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from)
}

async fn run_daemon(config_path_arg: Option<String>) -> Result<()> {
    let cfg_path = config_path(config_path_arg);
    let cfg = DaemonConfig::load_or_init(&cfg_path)?;
    info!("Using config from: {}", cfg_path.display());

    std::fs::create_dir_all(&cfg.root)
        .with_context(|| format!("Failed to create {}", cfg.root.display()))?;

    signals::install_signal_handlers()?;
    let listen = cfg.listen.clone();
    let daemon = Daemon::new(cfg, Arc::new(ProcessDriver::new()))?;

    // Every container is reconciled before the daemon takes notifications.
    let restored = daemon.restore()?;
    info!("restored {restored} containers");

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind notification address {listen}"))?;

    info!("shepherd daemon started (pid {})", std::process::id());
    handlers::serve(Arc::clone(&daemon), listener, async {
        signals::wait_for_shutdown().await;
    })
    .await?;
    info!("shepherd daemon exiting; monitor processes keep running");
    Ok(())
}

/// Print what the daemon would restore, without contacting it.
fn handle_status(config_path_arg: Option<String>) -> Result<()> {
    let cfg_path = config_path(config_path_arg);
    let cfg = DaemonConfig::load(&cfg_path)?;
    let found = restore::scan(&cfg.root, cfg.verify_liveness)
        .with_context(|| format!("Failed to scan {}", cfg.root.display()))?;

    println!(
        "{:<12}  {:<8}  {:>8}  {:>4}  {:>8}  {}",
        "CONTAINER", "STATUS", "PID", "EXIT", "RESTARTS", "IP"
    );
    for (container, _) in found {
        let state = &container.state;
        let id: String = container.id().chars().take(12).collect();
        println!(
            "{:<12}  {:<8}  {:>8}  {:>4}  {:>8}  {}",
            id,
            state.status,
            state.pid.map(|p| p.to_string()).unwrap_or_default(),
            state.exit_code.map(|c| c.to_string()).unwrap_or_default(),
            state.restart_count,
            container
                .network
                .ip_address
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
        );
    }
    Ok(())
}
