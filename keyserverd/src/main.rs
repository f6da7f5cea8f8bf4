//! Key server daemon.
//!
//! Keeps remote users' device lists in sync and records every change on the
//! key change log.
//!
//! Usage:
//!   keyserverd --data-dir /var/lib/keyserver run --local-server example.org
//!   keyserverd mark-stale @alice:remote.org
//!   keyserverd show @alice:remote.org
//!   keyserverd changes --from 120

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keyserverd::{build_key_server, DaemonConfig, Stores};
use keyserver_sync::SignalOutcome;
use keyserver_types::{ServerName, UserId};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "keyserverd")]
#[command(about = "Federated device list key server")]
struct Args {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the databases
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the resync workers until Ctrl-C
    Run {
        /// Our own server name
        #[arg(long)]
        local_server: Option<String>,

        /// Number of resync workers
        #[arg(long)]
        workers: Option<usize>,

        /// Send all federation requests to this base URL
        #[arg(long)]
        federation_base_url: Option<String>,
    },
    /// Flag a remote user's device list stale; a running daemon picks it up
    MarkStale {
        user_id: String,

        /// Server the user belongs to (defaults to the user ID's domain)
        #[arg(long)]
        server: Option<String>,
    },
    /// Print the stored device list of a user as JSON
    Show { user_id: String },
    /// Print key change records as JSON lines
    Changes {
        /// Print records after this position
        #[arg(long, default_value = "0")]
        from: i64,

        /// Maximum records to print
        #[arg(long, default_value = "1000")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let mut config = DaemonConfig::load(args.config.as_deref())?;
    let data_dir = config.data_dir(args.data_dir.as_deref());

    match args.command {
        Command::Run {
            local_server,
            workers,
            federation_base_url,
        } => {
            if let Some(name) = local_server {
                config.updater.local_server = name;
            }
            if let Some(n) = workers {
                config.updater.worker_count = n;
            }
            if federation_base_url.is_some() {
                config.federation.base_url_override = federation_base_url;
            }
            run(config, data_dir).await
        }
        Command::MarkStale { user_id, server } => {
            let user_id = parse_user(&user_id)?;
            let server = match server {
                Some(s) => ServerName::parse(&s).context("invalid server name")?,
                None => user_id.server_name(),
            };
            let key_server = build_key_server(Stores::open(&data_dir)?, &config)?;
            let outcome = key_server.mark_user_stale(&user_id, Some(&server)).await?;
            match outcome {
                SignalOutcome::AlreadyApplied => println!("{user_id} is already current"),
                _ => println!("{user_id} marked stale"),
            }
            Ok(())
        }
        Command::Show { user_id } => {
            let user_id = parse_user(&user_id)?;
            let stores = Stores::open(&data_dir)?;
            match stores.devices.get_device_list_state(&user_id)? {
                Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                None => println!("{user_id} has no stored device list"),
            }
            Ok(())
        }
        Command::Changes { from, limit } => {
            let stores = Stores::open(&data_dir)?;
            for record in stores.changes.read_after(from, limit)? {
                println!("{}", serde_json::to_string(&record)?);
            }
            Ok(())
        }
    }
}

async fn run(config: DaemonConfig, data_dir: PathBuf) -> Result<()> {
    info!(data_dir = %data_dir.display(), "key server starting");
    let stores = Stores::open(&data_dir)?;
    let key_server = build_key_server(stores, &config)?;

    let requeued = key_server
        .start()
        .await
        .context("startup recovery failed")?;

    println!("\n========================================");
    println!("  Key Server Running");
    println!("========================================");
    println!("  Server:    {}", key_server.local_server());
    println!("  Workers:   {}", config.updater.worker_count);
    println!("  Data dir:  {}", data_dir.display());
    println!("  Requeued:  {requeued}");
    println!("  Position:  {}", key_server.latest_position());
    println!("========================================\n");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutting down");
    key_server.shutdown().await?;
    Ok(())
}

fn parse_user(s: &str) -> Result<UserId> {
    UserId::parse(s).with_context(|| format!("invalid user id {s}"))
}
