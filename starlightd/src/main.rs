//! Starlight hub daemon.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use starlight_build_info::banner;
use starlightd::config::DriverKind;
use starlightd::mission::prune_screenshots;
use starlightd::{
    load_config, open_page, resolve_config_path, serve, spawn_heartbeat_monitor, spawn_mission_timer,
    Hub, ShutdownCause,
};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "starlightd", version)]
#[command(about = "Starlight hub: sentinel consensus and intent execution")]
struct Cli {
    /// Port to listen on (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Path to starlight.toml (or use STARLIGHT_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Do not launch the sentinels listed in the config
    #[arg(long)]
    no_sentinels: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Log filter directive, e.g. `starlightd=trace,info`
    #[arg(long)]
    log_level: Option<String>,

    /// Default URL for `goto` intents without one
    #[arg(long)]
    target_url: Option<String>,

    /// Run without a browser
    #[arg(long)]
    no_browser: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match (&cli.log_level, cli.debug) {
        (Some(directive), _) => directive.clone(),
        (None, true) => "debug".to_string(),
        (None, false) => "info".to_string(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
    info!("{}", banner("starlightd", VERSION));

    let config_path = resolve_config_path(cli.config.as_deref());
    let mut config = load_config(config_path.as_deref());
    if let Some(port) = cli.port {
        config.hub.port = port;
    }
    if cli.target_url.is_some() {
        config.hub.target_url = cli.target_url.clone();
    }
    if cli.no_browser {
        config.driver.kind = DriverKind::None;
    }

    let max_age = Duration::from_secs(config.paths.screenshot_max_age_secs);
    let pruned = prune_screenshots(&config.paths.screenshots, max_age);
    if pruned > 0 {
        info!(pruned, "Removed stale screenshots");
    }

    let page = match open_page(&config.driver, &config.paths.screenshots).await {
        Ok(page) => page,
        Err(err) => {
            error!("Cannot start the page driver: {:#}", err);
            std::process::exit(1);
        }
    };

    let bind = (config.hub.host.clone(), config.hub.port);
    let hub = Arc::new(Hub::new(config, page));

    let listener = match TcpListener::bind(bind.clone()).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("Cannot bind {}:{}: {}", bind.0, bind.1, err);
            let code = hub.shutdown("listener bind failed", ShutdownCause::StartupFailure).await;
            std::process::exit(code);
        }
    };

    spawn_signal_handlers(hub.clone());
    spawn_heartbeat_monitor(hub.clone());
    spawn_mission_timer(hub.clone());

    let server = tokio::spawn(serve(hub.clone(), listener));
    if cli.no_sentinels {
        info!("Sentinel launch disabled");
    } else {
        hub.launch_sentinels().await;
    }

    let code = hub.wait_for_exit().await;
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("Listener stopped with an error: {:#}", err),
        Err(err) => warn!("Listener task failed: {}", err),
    }
    std::process::exit(code);
}

fn spawn_signal_handlers(hub: Arc<Hub>) {
    let ctrl_c_hub = hub.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C; shutting down hub");
            ctrl_c_hub.shutdown("interrupted", ShutdownCause::Requested).await;
        }
    });

    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                return;
            }
        };
        tokio::spawn(async move {
            if sigterm.recv().await.is_some() {
                info!("Received SIGTERM; shutting down hub");
                hub.shutdown("terminated", ShutdownCause::Requested).await;
            }
        });
    }
}
