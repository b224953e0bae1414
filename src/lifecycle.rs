//! Process lifecycle: shutdown coordination, OS signals and the status report.
//!
//! ```text
//! SIGTERM / Ctrl-C → Shutdown::trigger → every pair closes its client leg (1001)
//!                  → listener dropped → wait for the registry to drain (bounded)
//! ```

use serde::Serialize;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info};

/// Broadcasts the shutdown request to every pair without polling.
///
/// Backed by a `watch` channel so a pair that subscribes after the trigger
/// still observes it.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            tx: watch::Sender::new(false),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Completes once shutdown has been triggered. Never completes if the
/// coordinator is gone without triggering.
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|triggered| *triggered).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Resolves on SIGTERM or Ctrl-C.
pub async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!(signal = "SIGINT", "Termination signal received"),
        () = terminate => info!(signal = "SIGTERM", "Termination signal received"),
    }
}

/// Routes panics through `tracing`; a panicking pair task takes down only its own pair.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(ToString::to_string)
            .unwrap_or_default();
        error!(%location, panic = %panic_info, "Task panicked");
    }));
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusReport {
    pub status: &'static str,
    pub service: String,
    pub uptime: f64,
    pub connections: usize,
}

#[derive(Debug, Clone)]
pub struct Uptime {
    service: String,
    started_at: Instant,
}

impl Uptime {
    pub fn start(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            started_at: Instant::now(),
        }
    }

    pub fn report(&self, connections: usize) -> StatusReport {
        StatusReport {
            status: "ok",
            service: self.service.clone(),
            uptime: self.started_at.elapsed().as_secs_f64(),
            connections,
        }
    }
}
