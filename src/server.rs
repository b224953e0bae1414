//! Accept loop and graceful shutdown.

use anyhow::Result;
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    proxy::{RelayContext, handle_connection},
    registry::Registry,
    stream::StreamType,
    tls::build_acceptor,
};

pub struct RelayServer {
    context: Arc<RelayContext>,
    tls: Option<TlsAcceptor>,
    shutdown_grace: Duration,
}

impl RelayServer {
    pub fn new(config: &Config) -> Result<Self> {
        let tls = config
            .listen
            .tls
            .as_ref()
            .map(build_acceptor)
            .transpose()?;

        Ok(Self {
            context: Arc::new(RelayContext::from_config(config)?),
            tls,
            shutdown_grace: config.relay.shutdown_grace(),
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.context.registry)
    }

    /// Serves `listener` until `signal` resolves, then closes every client
    /// leg with 1001 and waits (bounded) for the pairs to finish.
    pub async fn run<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(signal);

        loop {
            tokio::select! {
                () = &mut signal => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.spawn_connection(stream, addr),
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
            }
        }

        let registry = &self.context.registry;
        info!(
            connections = registry.connection_count(),
            "Shutting down, closing client connections"
        );
        self.context.shutdown.trigger();
        drop(listener);

        if timeout(self.shutdown_grace, registry.wait_idle()).await.is_err() {
            warn!(
                remaining = registry.connection_count(),
                grace = ?self.shutdown_grace,
                "Connections still open after shutdown grace period"
            );
        }
        info!("Server stopped");
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let context = Arc::clone(&self.context);
        let tls = self.tls.clone();

        tokio::spawn(async move {
            let stream = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => StreamType::Tls(Box::new(tls_stream)),
                    Err(e) => {
                        warn!(client_addr = %addr, error = %e, "TLS handshake failed");
                        return;
                    }
                },
                None => StreamType::Plain(stream),
            };

            if let Err(e) = handle_connection(stream, addr, context).await {
                warn!(client_addr = %addr, error = %e, "Connection failed");
            }
        });
    }
}
