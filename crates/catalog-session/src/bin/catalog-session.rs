//! Catalog Session Authority
//!
//! Runs one context of the session election against a shared store, or
//! inspects the lease that other contexts are contending for.

use anyhow::Result;
use catalog_session::{
    store::create_store_backend, LeaseStore, LeadershipEvent, SessionAuthority, SessionConfig,
    StoreBackendConfig,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[clap(
    name = "catalog-session",
    version,
    about = "Elects one context of the media catalog as the session authority"
)]
struct Args {
    /// Config file path
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Shared directory for the file store (overrides the config file)
    #[clap(long)]
    store_dir: Option<PathBuf>,

    /// Poll interval of the file store in milliseconds
    #[clap(long, default_value = "250")]
    poll_ms: u64,

    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join the election and hold or follow the lease until Ctrl-C
    Run,

    /// Print the current lease record
    Status,

    /// Remove the lease record so another context can claim at once
    Release,

    /// Write a default configuration file
    InitConfig {
        #[clap(default_value = "catalog-session.toml")]
        path: PathBuf,
    },
}

fn load_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            SessionConfig::from_file(path)?
        }
        None => SessionConfig::default(),
    };

    if let Some(dir) = &args.store_dir {
        config.store = StoreBackendConfig::File {
            dir: dir.clone(),
            poll_interval: Duration::from_millis(args.poll_ms),
        };
    }

    if matches!(config.store, StoreBackendConfig::Memory) {
        anyhow::bail!(
            "The in-memory store is private to this process; pass --store-dir or a config file with a sled or file store"
        );
    }

    config.validate()?;
    Ok(config)
}

/// Default configuration written by `init-config`
fn initial_config() -> SessionConfig {
    SessionConfig {
        store: StoreBackendConfig::File {
            dir: PathBuf::from("catalog-session-store"),
            poll_interval: Duration::from_millis(250),
        },
        ..SessionConfig::default()
    }
}

async fn run(config: SessionConfig) -> Result<()> {
    let authority = SessionAuthority::new(config).await?;
    authority.on_leadership_change(|event| match event {
        LeadershipEvent::Acquired { peer_id, .. } => {
            info!("Peer {} is now the session authority", peer_id)
        }
        LeadershipEvent::Lost { peer_id, holder, .. } => match holder {
            Some(holder) => info!("Peer {} yielded to {}", peer_id, holder),
            None => info!("Peer {} is no longer the session authority", peer_id),
        },
    });

    authority.start().await?;
    info!("Peer {} joined the election", authority.peer_id());

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    authority.shutdown().await;
    Ok(())
}

async fn leases(config: &SessionConfig) -> Result<LeaseStore> {
    let store = create_store_backend(&config.store).await?;
    Ok(LeaseStore::new(store, config.coordination_key.clone()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("catalog_session={}", log_level))),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Command::InitConfig { path } = &args.command {
        initial_config().to_file(path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let config = load_config(&args)?;

    match args.command {
        Command::Run => {
            if let Err(e) = run(config).await {
                error!("Session authority failed: {}", e);
                std::process::exit(1);
            }
        }
        Command::Status => {
            let leases = leases(&config).await?;
            match leases.read_strict().await {
                Ok(Some(record)) => {
                    let age = record.age(chrono::Utc::now()).num_milliseconds();
                    let stale = record.is_stale(chrono::Utc::now(), config.stale_timeout);
                    println!("Key:       {}", leases.key());
                    println!("Holder:    {}", record.peer_id);
                    println!("Timestamp: {}", record.timestamp);
                    println!("Age:       {} ms{}", age, if stale { " (stale)" } else { "" });
                }
                Ok(None) => println!("No lease under {}", leases.key()),
                Err(e) => println!("Lease under {} is unreadable: {}", leases.key(), e),
            }
        }
        Command::Release => {
            let leases = leases(&config).await?;
            leases.clear().await?;
            println!("Removed lease under {}", leases.key());
        }
        Command::InitConfig { .. } => {}
    }

    Ok(())
}
