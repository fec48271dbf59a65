// ashdht: command line node for the rendezvous-bootstrapped overlay
//
// `ashdht` (or `ashdht run`) starts a node in the configured mode.
// `ashdht config ...` inspects and edits the config file.
// `ashdht nodes` prints the cached node list.

mod config;

use anyhow::{Context, Result};
use ashdht_core::{
    start_overlay, HttpEchoResolver, IgdPortMapper, IrcConfig, IrcConnector, NodeContext,
    NodeEvent, NodeSettings, PeerListError, PeerListStore, PortLifecycle,
};
use clap::{Parser, Subcommand};
use colored::*;
use config::{Config, ConfigOverrides};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "ashdht")]
#[command(about = "Ash DHT: overlay node bootstrapped over IRC", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigOverrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node (default)
    Run,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show the cached node list
    Nodes,
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    /// Print the config file location
    Path,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = Config::resolve_path(cli.config)?;
    let file_config = Config::load_or_create(&config_path)?;
    let config = cli.overrides.apply(file_config.clone());

    let default_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd_run(config).await,
        Commands::Config { action } => cmd_config(&config_path, file_config, action),
        Commands::Nodes => cmd_nodes(&config),
    }
}

fn cmd_config(path: &Path, mut config: Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save(path)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else if config.list().iter().any(|(k, _)| *k == key) {
                println!("{} = {}", key.bright_cyan(), "(unset)".dimmed());
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Path => {
            println!("{}", path.display());
        }
    }

    Ok(())
}

fn cmd_nodes(config: &Config) -> Result<()> {
    let path = config.node_list_path()?;
    let store = PeerListStore::new(&path);

    match store.load() {
        Ok(nodes) if nodes.is_empty() => {
            println!("{}", "Node list is empty.".dimmed());
        }
        Ok(nodes) => {
            println!("{} ({} total)", "Cached nodes".bold(), nodes.len());
            println!();
            for node in nodes {
                println!("  {} {}", "•".bright_green(), node);
            }
        }
        Err(PeerListError::NotFound(_)) => {
            println!("{}", "No node list yet.".dimmed());
            println!("  Expected at: {}", path.display().to_string().bright_cyan());
        }
        Err(e) => return Err(e).context("Failed to read node list"),
    }

    Ok(())
}

async fn cmd_run(config: Config) -> Result<()> {
    println!("{}", "Ash DHT: starting...".bold());
    println!();

    let node_list = config.node_list_path()?;
    println!("{} Mode: {}", "✓".green(), config.mode.to_string().bright_cyan());
    println!("{} Node list: {}", "✓".green(), node_list.display());

    let keypair = libp2p::identity::Keypair::generate_ed25519();
    println!("{} Overlay peer ID: {}", "✓".green(), keypair.public().to_peer_id());
    let overlay = start_overlay(keypair)
        .await
        .context("Failed to start overlay node")?;

    let mut irc = IrcConfig::new(&config.irc_server, &config.channel);
    irc.port = config.irc_port;
    irc.tls = config.irc_tls;
    println!(
        "{} Rendezvous: {} on {}:{}{}",
        "✓".green(),
        config.channel.bright_cyan(),
        config.irc_server,
        config.irc_port,
        if config.irc_tls { " (TLS)" } else { "" }
    );
    println!();

    let settings = NodeSettings::new(config.mode, &config.channel, config.port)
        .with_token(&config.bootstrap_command);
    let port = Arc::new(PortLifecycle::new(Arc::new(IgdPortMapper::new()), config.port));

    let (event_tx, mut event_rx) = mpsc::channel(16);
    let ctx = NodeContext::new(
        settings,
        Arc::new(overlay.clone()),
        Arc::new(IrcConnector::new(irc)),
        Arc::new(HttpEchoResolver::default()),
        PeerListStore::new(node_list),
        port,
    )
    .with_events(event_tx);

    let event_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(&event);
        }
    });

    let result = ctx.run(shutdown_signal()).await;

    drop(ctx);
    let _ = event_task.await;
    if let Err(e) = overlay.shutdown().await {
        tracing::debug!("Overlay already stopped: {}", e);
    }

    if result.is_ok() {
        println!("{} Stopped", "✓".green());
    }
    result
}

fn print_event(event: &NodeEvent) {
    match event {
        NodeEvent::PortMapping { port, mapped: true } => {
            println!("{} UDP port {} forwarded", "✓".green(), port);
        }
        NodeEvent::PortMapping { port, mapped: false } => {
            println!(
                "{} UDP port {} not forwarded; peers behind NAT may not reach us",
                "!".yellow(),
                port
            );
        }
        NodeEvent::Listening { port } => {
            println!("{} Overlay listening on UDP {}", "✓".green(), port);
        }
        NodeEvent::Acquired { via, peers } => {
            println!("{} Bootstrapped via {:?} ({} peers)", "✓".green(), via, peers);
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
