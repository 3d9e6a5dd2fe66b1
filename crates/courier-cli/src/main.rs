//! Courier CLI: run a host node and probe other hosts from the terminal.

mod cli;

use crate::cli::{Cli, Commands};
use anyhow::{Context, Result};
use clap::Parser;
use courier_runtime::{Agent, RequestLayer, RequestOptions, TransportRegistry};
use courier_types::{NodeConfig, Transport, TransportConfig};
use courier_wire::{Host, MeshTransport};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Parse a JSON argument, treating anything that is not JSON as a string.
fn parse_json_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = courier_runtime::load_config(cli.config.as_deref());
    init_tracing(&config.log_level);

    match cli.command {
        Commands::Host {
            listen,
            join,
            network_id,
        } => cmd_host(config, listen, join, network_id).await,
        Commands::Ping { url, data } => cmd_ping(config, &url, parse_json_arg(&data)).await,
        Commands::Send {
            via,
            to,
            from,
            request,
            timeout_ms,
            message,
        } => {
            let timeout = request.then(|| Duration::from_millis(timeout_ms));
            cmd_send(config, &via, &from, &to, parse_json_arg(&message), timeout).await
        }
        Commands::Config => {
            let text = toml::to_string_pretty(&config).context("Failed to render config")?;
            print!("{text}");
            Ok(())
        }
    }
}

async fn cmd_host(
    mut config: NodeConfig,
    listen: Option<String>,
    join: Vec<String>,
    network_id: Option<String>,
) -> Result<()> {
    if network_id.is_some() {
        config.host.network_id = network_id;
    }
    let listen = listen
        .or(config.listen.take())
        .unwrap_or_else(|| "127.0.0.1:0".to_string());
    config.join.extend(join);

    let host = Host::new(config.host.clone());
    let mut events = host.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "Failed to render host event"),
            }
        }
    });

    let url = host
        .listen(&listen)
        .await
        .with_context(|| format!("Failed to listen on {listen}"))?;
    info!(url = %url, "Host running");

    for peer_url in &config.join {
        if let Err(e) = host.join(peer_url).await {
            warn!(url = %peer_url, error = %e, "Join failed");
        }
    }

    // `mesh` entries bind to this node's host rather than starting their own.
    let mut registry = TransportRegistry::with_builtin_types();
    registry.share_mesh_host(host.clone());
    for transport in registry.load_all(config.transports.clone()).await? {
        info!(transport = %transport.info().transport_type, id = ?transport.info().id, "Transport loaded");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl+C")?;
    info!("Shutting down");
    registry.clear().await?;
    host.close().await?;
    Ok(())
}

/// A short-lived host joined to `url`, for one-off commands.
async fn probe_host(config: &NodeConfig, url: &str) -> Result<Host> {
    let host = Host::new(config.host.clone());
    host.listen("127.0.0.1:0")
        .await
        .context("Failed to open a local listener")?;
    host.join(url)
        .await
        .with_context(|| format!("Failed to join {url}"))?;
    Ok(host)
}

async fn cmd_ping(config: NodeConfig, url: &str, data: Value) -> Result<()> {
    let host = probe_host(&config, url).await?;
    let result = host.ping(url, data).await;
    host.close().await?;
    let echoed = result.with_context(|| format!("Ping to {url} failed"))?;
    println!("{echoed}");
    Ok(())
}

async fn cmd_send(
    config: NodeConfig,
    via: &str,
    from: &str,
    to: &str,
    message: Value,
    reply_timeout: Option<Duration>,
) -> Result<()> {
    let host = probe_host(&config, via).await?;
    let transport: Arc<dyn Transport> =
        Arc::new(MeshTransport::new(host.clone(), &TransportConfig::new("mesh")));

    let agent = Agent::new(from);
    if let Some(timeout) = reply_timeout {
        agent.extend(Arc::new(RequestLayer::new(RequestOptions { timeout })))?;
    }
    agent.connect(&transport).await?;

    let outcome = match reply_timeout {
        Some(_) => agent.request(to, message).await.map(Some),
        None => agent.send(to, message).await.map(|_| None),
    };

    agent.disconnect_all().await?;
    host.close().await?;
    match outcome.with_context(|| format!("Failed to deliver to {to}"))? {
        Some(reply) => println!("{reply}"),
        None => info!(to = %to, "Message delivered"),
    }
    Ok(())
}
