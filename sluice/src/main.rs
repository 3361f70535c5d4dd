use clap::Parser;
use sluice::http::{router, AppState};
use sluice::{GatewayConfig, NoopAssembler, Orchestrator};
use sluice_core::broker::ChannelBroker;
use sluice_router::{Router, StaticMappingStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sluice", about = "Streaming LLM gateway", version)]
struct Cli {
    /// Path to the gateway configuration file.
    #[arg(long, default_value = "sluice.toml")]
    config: PathBuf,
    /// Override the bind address from the config file.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("SLUICE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = GatewayConfig::load(&cli.config)?;
    let bind = cli.bind.unwrap_or_else(|| config.server.bind.clone());

    let broker = Arc::new(ChannelBroker::new());
    let model_router = Router::new(
        StaticMappingStore::new(config.mappings.clone()),
        config.routing.clone(),
    );
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&broker),
        model_router,
        config.endpoints.clone(),
        Box::new(NoopAssembler),
    ));

    let state = AppState {
        broker,
        orchestrator,
        stream_slots: Arc::new(Semaphore::new(config.server.max_concurrent_streams)),
        heartbeat: Duration::from_secs(config.server.heartbeat_secs),
        chunk_max_chars: config.server.chunk_max_chars,
    };

    let session_ttl = Duration::from_secs(config.server.session_ttl_secs.max(1));
    let sweep_broker = Arc::clone(&state.broker);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(session_ttl);
        loop {
            tick.tick().await;
            sweep_broker.sweep(session_ttl);
        }
    });

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, endpoints = config.endpoints.len(), "sluice listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install ctrl-c handler");
        return;
    }
    tracing::info!("shutdown requested");
}
