// satellite — self-hosted relay node
//
// Runs the operator control socket and bridges hosted communities to their
// upstream relays.

mod config;
mod server;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use satellite_core::control::{
    register_builtin_actions, register_dm_actions, ControlChannel, StatusPatch,
};
use satellite_core::{
    ConfigStore, DirectMessageForwarder, EventStore, FanoutForwarder, FileConfigStore,
    MemoryEventStore, NoTunnelResolver, RelayBridge, RelayPool, StoreRelayDirectory,
    WebSocketConnector,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "satellite")]
#[command(about = "Satellite self-hosted relay node", long_about = None)]
#[command(version)]
struct Cli {
    /// Node config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Run {
        /// Control socket port (defaults to relayPort from the config)
        #[arg(long)]
        control_port: Option<u16>,
        /// Token operators must present on control messages
        #[arg(long, env = "SATELLITE_AUTH", hide_env_values = true)]
        auth_token: Option<String>,
        /// Community definition file to bridge (repeatable)
        #[arg(long = "community")]
        communities: Vec<PathBuf>,
    },
    /// Inspect or change the node config
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Set { key: String, value: String },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => config::default_config_path()?,
    };

    // One cooperative loop for the whole node
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;

    runtime.block_on(async move {
        match cli.command {
            Commands::Run {
                control_port,
                auth_token,
                communities,
            } => cmd_run(config_path, control_port, auth_token, communities).await,
            Commands::Config { action } => cmd_config(config_path, action),
        }
    })
}

fn load_config(path: &Path) -> Result<FileConfigStore> {
    FileConfigStore::load(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

fn cmd_config(path: PathBuf, action: ConfigAction) -> Result<()> {
    let store = load_config(&path)?;
    match action {
        ConfigAction::Show => {
            println!("{} {}", "Config:".bold(), path.display());
            println!("{}", serde_json::to_string_pretty(&store.get().to_value())?);
        }
        ConfigAction::Set { key, value } => {
            store
                .merge(&config::config_patch(&key, &value))
                .with_context(|| format!("Failed to set {}", key))?;
            println!("  {} {} updated", "✓".green(), key);
        }
    }
    Ok(())
}

async fn cmd_run(
    config_path: PathBuf,
    control_port: Option<u16>,
    auth_token: Option<String>,
    communities: Vec<PathBuf>,
) -> Result<()> {
    let token = auth_token.context("An auth token is required (--auth-token or SATELLITE_AUTH)")?;
    let config_store = Arc::new(load_config(&config_path)?);
    let port = control_port.unwrap_or(config_store.get().relay_port);

    let events: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());

    let control = ControlChannel::new(
        config_store.clone(),
        events.clone(),
        Arc::new(move |presented: &str| presented == token),
    );
    register_builtin_actions(&control);
    control.watch_inserted();

    let pool = Arc::new(RelayPool::new(Arc::new(WebSocketConnector::default())));
    let dms = Arc::new(DirectMessageForwarder::new(
        FanoutForwarder::new(pool.clone()),
        Arc::new(StoreRelayDirectory::new(events.clone())),
    ));
    let config_watch = dms.watch_config(config_store.as_ref());
    register_dm_actions(&control, dms.clone());
    let dm_watch = forward_owner_messages(events.as_ref(), dms, control.clone());

    let mut bridges = Vec::new();
    for path in &communities {
        let definition = config::load_community(path)?;
        let bridge = RelayBridge::new(
            definition,
            Arc::new(NoTunnelResolver),
            Arc::new(WebSocketConnector::default()),
            events.clone(),
        );
        bridge.set_status_sink(Arc::new(control.clone()));
        if let Err(e) = bridge.start().await {
            warn!(owner = %bridge.definition().owner, "Upstream unavailable: {}", e);
        }
        bridges.push(bridge);
    }

    let server = server::start(port, control.clone());
    control.set_status(StatusPatch {
        listening: Some(true),
        ..StatusPatch::default()
    });
    info!(
        communities = bridges.len(),
        config = %config_path.display(),
        "Satellite node running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    for bridge in &bridges {
        bridge.stop();
    }
    control.set_status(StatusPatch {
        listening: Some(false),
        ..StatusPatch::default()
    });
    control.stop();
    config_watch.abort();
    dm_watch.abort();
    pool.close();
    server.abort();
    Ok(())
}

/// Push every stored owner DM out to its recipients and log the outcome
fn forward_owner_messages(
    events: &dyn EventStore,
    dms: Arc<DirectMessageForwarder>,
    control: ControlChannel,
) -> JoinHandle<()> {
    let mut inserted = events.subscribe_inserted();
    tokio::spawn(async move {
        loop {
            let event = match inserted.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed inserted events; some DMs were not forwarded");
                    continue;
                }
                Err(RecvError::Closed) => return,
            };
            match dms.handle_local_event(&event).await {
                Some(Ok(summary)) => control.log(&format!("[DM] {}", summary)),
                Some(Err(e)) => control.log(&format!("[DM] {}", e)),
                None => debug!(event_id = %event.id, "Not an owner DM"),
            }
        }
    })
}
