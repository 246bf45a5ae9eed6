use axum::Router;
use roomcast_core::Config;
use roomcast_sfu::RoomDirectory;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

/// HTTP server plus the room directory it fronts
pub struct RoomcastServer {
    config: Config,
    directory: Arc<RoomDirectory>,
    router: Router,
}

impl RoomcastServer {
    pub fn new(config: Config, directory: Arc<RoomDirectory>, router: Router) -> Self {
        Self {
            config,
            directory,
            router,
        }
    }

    /// Serve until SIGINT/SIGTERM, then close every room.
    pub async fn run(self) -> anyhow::Result<()> {
        let http_address = self.config.http_address();
        let http_addr: SocketAddr = http_address
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{http_address}': {e}"))?;

        let listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_addr}: {e}"))?;
        info!("HTTP server listening on {}", http_addr);

        if let Err(e) = axum::serve(listener, self.router.clone())
            .with_graceful_shutdown(shutdown_signal())
            .await
        {
            error!("HTTP server error: {}", e);
        }
        info!("HTTP server shut down gracefully");

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&self) {
        let stats = self.directory.stats();
        info!(
            rooms = stats.rooms,
            participants = stats.participants,
            "Shutting down Roomcast server..."
        );
        self.directory.shutdown().await;
        info!("Shutdown complete");
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
