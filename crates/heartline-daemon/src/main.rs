//! heartline: run a hub, or a member that keeps one connection to a hub alive.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use heartline_core::{HubConfig, HubEvent, MemberConfig, MemberEvent};
use heartline_daemon::{Hub, Member};

#[derive(Parser, Debug)]
#[command(name = "heartline")]
#[command(about = "WebSocket hub/member connection with heartbeats and reconnection")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept member connections
    Hub(HubArgs),
    /// Connect to a hub and stay connected
    Member(MemberArgs),
}

#[derive(Args, Debug)]
struct HubArgs {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// JSON config file (defaults are used if it does not exist)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Heartbeat interval in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Missed heartbeats tolerated before eviction
    #[arg(long)]
    max_strikes: Option<u32>,

    /// Required upgrade parameter (repeatable)
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    params: Vec<(String, String)>,
}

#[derive(Args, Debug)]
struct MemberArgs {
    /// Hub URL (ws:// or wss://)
    #[arg(short, long)]
    url: Option<String>,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Parameter sent with the upgrade request (repeatable)
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// Delay between reconnect attempts in milliseconds
    #[arg(long)]
    retry_ms: Option<u64>,

    /// Reconnect attempts before giving up
    #[arg(long, conflicts_with = "unbounded")]
    max_attempts: Option<u32>,

    /// Retry forever
    #[arg(long)]
    unbounded: bool,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", raw)),
    }
}

fn hub_config(args: &HubArgs) -> Result<HubConfig> {
    let mut config = match &args.config {
        Some(path) => HubConfig::load(path)
            .with_context(|| format!("Failed to load hub config from {:?}", path))?,
        None => HubConfig::default(),
    };

    if let Some(interval_ms) = args.interval_ms {
        config.heartbeat.interval_ms = interval_ms;
    }
    if let Some(max_strikes) = args.max_strikes {
        config.heartbeat.max_strikes = max_strikes;
    }
    if !args.params.is_empty() {
        config
            .auth
            .parameters
            .get_or_insert_with(HashMap::new)
            .extend(args.params.iter().cloned());
    }

    config.validate()?;
    Ok(config)
}

fn member_config(args: &MemberArgs) -> Result<MemberConfig> {
    let mut config = match (&args.config, &args.url) {
        (Some(path), _) => MemberConfig::load(path)
            .with_context(|| format!("Failed to load member config from {:?}", path))?,
        (None, Some(url)) => MemberConfig::new(url.clone()),
        (None, None) => bail!("Either --url or --config is required"),
    };

    if let (Some(_), Some(url)) = (&args.config, &args.url) {
        config.url = url.clone();
    }
    config.parameters.extend(args.params.iter().cloned());
    if let Some(retry_ms) = args.retry_ms {
        config.reconnect.interval_ms = retry_ms;
    }
    if args.unbounded {
        config.reconnect.max_attempts = None;
    } else if let Some(max_attempts) = args.max_attempts {
        config.reconnect.max_attempts = Some(max_attempts);
    }

    config.validate()?;
    Ok(config)
}

async fn run_hub(args: HubArgs) -> Result<()> {
    let config = hub_config(&args)?;
    info!(
        "Heartbeat every {}ms, evicting after {} strike(s)",
        config.heartbeat.interval_ms, config.heartbeat.max_strikes
    );

    let hub = Hub::new(config)?;
    let _events = hub.subscribe(|event| match event {
        HubEvent::Message { id, text } => println!("{}: {}", id, text),
        HubEvent::Evicted { id, .. } => warn!("Evicted {}", id),
        _ => {}
    });

    let listener = Hub::bind(&args.listen).await?;
    let server = hub.clone();
    let serving = tokio::spawn(async move { server.serve(listener).await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutdown signal received");
    hub.destroy();

    serving.await.context("Hub task panicked")??;
    Ok(())
}

async fn run_member(args: MemberArgs) -> Result<()> {
    let config = member_config(&args)?;
    let member = Member::new(config)?;

    let _events = member.subscribe(|event| match event {
        MemberEvent::Message(text) => println!("{}", text),
        MemberEvent::Reconnecting { attempt, delay_ms } => {
            info!("Reconnecting in {}ms (attempt {})", delay_ms, attempt)
        }
        _ => {}
    });

    member
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", member.url()))?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if let Err(e) = member.send(line) {
                        warn!("Message not sent: {}", e);
                    }
                }
                None => {
                    info!("Stdin closed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    member.destroy();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if cli.verbose {
        "debug,heartline_daemon=debug,heartline_core=debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Hub(args) => run_hub(args).await,
        Command::Member(args) => run_member(args).await,
    }
}
