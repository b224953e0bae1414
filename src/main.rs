use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use ws_relay_proxy::{Config, RelayServer, lifecycle};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    lifecycle::install_panic_hook();

    let config = Config::load()?;
    info!(
        listen_ip = %config.listen.ip,
        listen_port = config.listen.port,
        tls = config.listen.tls.is_some(),
        backend_url = %config.backend.url,
        allowed_origins = ?config.relay.allowed_origins,
        max_connections = config.limits.max_connections,
        max_connections_per_ip = config.limits.max_connections_per_ip,
        ping_interval_ms = config.relay.ping_interval_ms,
        "Configuration loaded"
    );

    let addr = format!("{}:{}", config.listen.ip, config.listen.port);
    let server = RelayServer::new(&config)?;
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to address {addr}"))?;

    info!(listen_addr = %addr, "WebSocket relay listening");

    server.run(listener, lifecycle::termination_signal()).await
}
