//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use crate::client::BridgeClient;

use super::routes::{ApiOptions, routes};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Include the error source chain in 5xx response bodies.
    pub include_error_stack: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 53631,
            include_error_stack: true,
        }
    }
}

/// Serve the bridge over HTTP until SIGINT/SIGTERM, then destroy it.
pub async fn serve(config: ServerConfig, bridge: BridgeClient) -> anyhow::Result<()> {
    let app = routes(
        Arc::new(bridge.clone()),
        ApiOptions {
            include_error_stack: config.include_error_stack,
        },
    );

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Server is listening at http://{}/api", actual_addr);

    let drain = bridge.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let signal = wait_for_signal().await;
        info!(
            signal,
            in_flight = drain.pending_calls(),
            "Stopping listener"
        );
    })
    .await?;

    let live = bridge.destroy().await;
    info!(live, "Bridge destroyed, server stopped");

    Ok(())
}

/// Resolves with the name of the first termination signal received.
///
/// # Panics
///
/// Panics when the runtime cannot install signal handlers; startup should fail then.
async fn wait_for_signal() -> &'static str {
    let interrupt = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for SIGINT");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        signal(SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
