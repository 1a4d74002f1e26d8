//! Replay a JSON-lines intent script against the hub.
//!
//! Each non-empty line is an intent params object, e.g.
//! `{"cmd":"goto","url":"https://shop.test"}`. Outcomes are printed as JSON
//! lines on stdout.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use starlight_client::{hub_url_from_env, IntentClient};
use starlight_protocol::IntentParams;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "starlight-intent", version)]
#[command(about = "Send intents to a Starlight hub")]
struct Cli {
    /// Hub WebSocket URL (or use HUB_URL)
    #[arg(long)]
    hub: Option<String>,

    /// Script to replay; stdin when omitted
    script: Option<PathBuf>,

    /// Seconds to wait for each intent
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    /// Ask the hub to finish the mission after the script
    #[arg(long)]
    finish: bool,

    /// Keep going after a failed intent
    #[arg(long)]
    keep_going: bool,

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
    let mut client = IntentClient::connect(&url)
        .await
        .with_context(|| format!("connecting to {url}"))?
        .with_timeout(Duration::from_secs(cli.timeout));

    let lines = match &cli.script {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?
            .lines()
            .map(str::to_string)
            .collect::<Vec<_>>(),
        None => {
            let mut lines = Vec::new();
            let mut reader = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = reader.next_line().await? {
                lines.push(line);
            }
            lines
        }
    };

    let mut failures = 0usize;
    for (number, line) in lines.iter().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let params: IntentParams =
            serde_json::from_str(line).with_context(|| format!("line {}: not an intent", number + 1))?;
        let outcome = client.intent(&params).await?;
        println!("{}", serde_json::to_string(&outcome)?);
        if !outcome.success {
            failures += 1;
            warn!(line = number + 1, cmd = %params.cmd, error = ?outcome.error, "intent failed");
            if !cli.keep_going {
                break;
            }
        }
    }

    if cli.finish {
        let reason = if failures == 0 { "script complete" } else { "script failed" };
        client.finish(reason).await?;
    } else {
        client.close().await?;
    }
    info!(failures, "script finished");

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}
