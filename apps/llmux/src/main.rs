use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use llmux_core::{AppState, NoopUserStore, ProxyEngine, WreqUpstreamClient};
use llmux_core::upstream::UpstreamClientConfig;
use llmux_keypool::{KeyPool, spawn_recheckers};
use llmux_queue::{AdmissionQueue, spawn_dispatcher};

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = cli::Cli::parse().into_config()?;
    let keypool = Arc::new(KeyPool::new(cli::keys_from_env()));
    if config.check_keys {
        spawn_recheckers(keypool.clone());
    }

    let queue = AdmissionQueue::new(keypool.clone());
    spawn_dispatcher(queue.clone());

    let client_config = UpstreamClientConfig {
        request_timeout: config.request_timeout,
        ..UpstreamClientConfig::default()
    };
    let client: Arc<dyn llmux_core::UpstreamClient> =
        Arc::new(WreqUpstreamClient::new(client_config)?);

    let bind = format!("{}:{}", config.host, config.port);
    let state = AppState::new(config, keypool, queue, client, Arc::new(NoopUserStore));
    let engine = Arc::new(ProxyEngine::new(state));

    let app = llmux_router::proxy_router(engine);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
