use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use market_sync::config::{FileConfig, load_config};
use market_sync::{
    ChannelId, ConnectionState, Credential, EventKind, HttpApi, ServerEvent, Session, SyncConfig,
    SyncError, WsConnector,
};

#[derive(Parser)]
#[command(name = "market-sync")]
#[command(about = "Marketplace live sync client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory containing market-sync.toml
    #[arg(long, global = true, default_value = ".")]
    config_dir: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and log live events until interrupted
    Watch(WatchArgs),

    /// Print the resolved configuration
    Config,
}

#[derive(Parser)]
struct WatchArgs {
    /// Bearer token for the live channel and API
    #[arg(long)]
    token: String,

    /// Conversation channels to join (repeatable)
    #[arg(long = "join")]
    join: Vec<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config => print_config(&cli.config_dir),
        Commands::Watch(args) => watch(args, &cli.config_dir).await,
    }
}

fn print_config(config_dir: &std::path::Path) -> Result<()> {
    let file: FileConfig = load_config(config_dir)
        .extract()
        .with_context(|| format!("failed to load config from {}", config_dir.display()))?;
    println!("{}", serde_json::to_string_pretty(&file)?);
    Ok(())
}

async fn watch(args: WatchArgs, config_dir: &std::path::Path) -> Result<()> {
    let default_directive = if args.debug {
        "market_sync=debug,info"
    } else {
        "market_sync=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config = SyncConfig::load(config_dir).context("failed to load configuration")?;
    info!(ws_url = %config.ws_url, api_url = %config.api_url, "starting market-sync watch");

    let credential = Credential::new(args.token);
    let connector = Arc::new(WsConnector::new(config.ws_url.clone(), config.channel_capacity));
    let api = Arc::new(HttpApi::new(config.api_url.clone(), credential.clone()));
    let session = Session::new(config, connector, api);

    match session.refresh_favorites().await {
        Ok(count) => info!(count, "favorites loaded"),
        Err(e) => warn!("could not load favorites: {}", e),
    }
    match session.refresh_conversations().await {
        Ok(count) => info!(
            count,
            total_unread = session.conversations().total_unread(),
            "conversations loaded"
        ),
        Err(e) => warn!("could not load conversations: {}", e),
    }
    for channel in args.join {
        session.join_conversation(ChannelId::from(channel));
    }

    let (state_tx, mut state_rx) = mpsc::unbounded_channel();
    let _state_sub = session.on_state_change(move |change| {
        let _ = state_tx.send(change.clone());
    });
    let _message_sub = session.events().on(EventKind::MessageNew, |event| {
        if let ServerEvent::MessageNew { channel_id, message } = event {
            info!(channel = %channel_id, sender = %message.sender_id, "{}", message.content);
        }
    });
    let _favorite_sub = session.events().on(EventKind::FavoriteUpdated, |event| {
        if let ServerEvent::FavoriteUpdated { entity_id, favorited } = event {
            info!(entity = %entity_id, favorited, "favorite updated");
        }
    });

    if let Err(e) = session.connect(Some(credential)).await {
        if e.is_fatal() {
            return Err(e).context("live channel rejected the credential");
        }
        warn!(recovery = ?e.recovery(), "initial connection failed, retrying: {}", e);
    }

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break Ok(());
            }
            change = state_rx.recv() => {
                let Some(change) = change else { break Ok(()) };
                if change.current == ConnectionState::Disconnected {
                    match change.error {
                        Some(err @ (SyncError::Auth(_) | SyncError::ReconnectExhausted { .. })) => {
                            break Err(err);
                        }
                        _ => {}
                    }
                }
            }
        }
    };

    session.teardown();
    match outcome {
        Ok(()) => Ok(()),
        Err(err) => bail!("live channel closed: {} ({})", err, err.error_code()),
    }
}
