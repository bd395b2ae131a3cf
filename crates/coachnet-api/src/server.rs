//! [`ApiServer`] – binds the router to a TCP port.

use std::net::SocketAddr;

use coachnet_types::GatewayError;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::routes::create_router;
use crate::state::AppState;

/// Default TCP port for the HTTP/WebSocket API.
pub const DEFAULT_PORT: u16 = 8088;

pub struct ApiServer {
    state: AppState,
    port: u16,
}

impl ApiServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            port: DEFAULT_PORT,
        }
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serve until `shutdown` flips to `true`.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Config`] if the port cannot be bound,
    /// [`GatewayError::Unavailable`] if the server fails while running.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), GatewayError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::Config(format!("cannot bind api on {addr}: {e}")))?;
        info!(%addr, "api listening");

        axum::serve(listener, create_router(self.state))
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            })
            .await
            .map_err(|e| GatewayError::Unavailable(format!("api server: {e}")))?;
        info!("api stopped");
        Ok(())
    }
}
