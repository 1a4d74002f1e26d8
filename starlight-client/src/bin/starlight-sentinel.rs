//! Pass-through sentinel: clears every pre_check and keeps a heartbeat.
//! Useful as a quorum member in tests and as a template for real sentinels.

use std::io;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use starlight_client::{hub_url_from_env, HubEvent, SentinelOptions, SentinelSession};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "starlight-sentinel", version)]
#[command(about = "Minimal Starlight sentinel")]
struct Cli {
    /// Hub WebSocket URL (or use HUB_URL)
    #[arg(long)]
    hub: Option<String>,

    /// Layer name announced at registration (or STARLIGHT_SENTINEL_NAME)
    #[arg(long)]
    layer: Option<String>,

    #[arg(long, default_value_t = 5)]
    priority: u8,

    /// Selector to watch; repeat for more
    #[arg(long = "watch")]
    watch: Vec<String>,

    /// Registration token when the hub requires one (or STARLIGHT_AUTH_TOKEN)
    #[arg(long)]
    auth_token: Option<String>,

    /// Sign registration with this HS256 secret (or STARLIGHT_JWT_SECRET)
    #[arg(long)]
    jwt_secret: Option<String>,

    /// Heartbeat period in milliseconds
    #[arg(long, default_value_t = 1000)]
    pulse_ms: u64,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(if cli.debug { "debug" } else { "info" })
        .with_writer(io::stderr)
        .init();

    let url = cli.hub.clone().unwrap_or_else(hub_url_from_env);
    let layer = cli
        .layer
        .clone()
        .or_else(|| std::env::var("STARLIGHT_SENTINEL_NAME").ok())
        .unwrap_or_else(|| "passthrough".to_string());

    let mut options = SentinelOptions::new(layer).watching(cli.watch.clone());
    options.priority = cli.priority;
    if let Some(token) = cli
        .auth_token
        .clone()
        .or_else(|| std::env::var("STARLIGHT_AUTH_TOKEN").ok())
    {
        options = options.with_token(token);
    }
    if let Some(secret) = cli
        .jwt_secret
        .clone()
        .or_else(|| std::env::var("STARLIGHT_JWT_SECRET").ok())
    {
        options = options.with_jwt_secret(secret);
    }

    let mut session = SentinelSession::connect(&url, options)
        .await
        .with_context(|| format!("registering with {url}"))?;
    info!(layer = %session.layer(), id = %session.assigned_id(), "sentinel online");

    let period = Duration::from_millis(cli.pulse_ms.max(100));
    session.pulse("online").await?;
    loop {
        match session.next_event(period).await? {
            Some(HubEvent::PreCheck(pre_check)) => {
                debug!(round = %pre_check.id, command = %pre_check.command, blocking = pre_check.blocking.len(), "clearing");
                session.clear(Some(&pre_check.id)).await?;
            }
            Some(HubEvent::CommandComplete(done)) => {
                info!(id = %done["id"], success = %done["success"], "command complete")
            }
            Some(other) => debug!(event = ?other, "ignored"),
            None => {}
        }
        session.pulse("online").await?;
    }
}
