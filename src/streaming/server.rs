use super::handlers::{not_found, snapshot_endpoint, stream_endpoint};
use crate::buffer::BufferManager;
use crate::config::RelayConfig;
use crate::error::{Result, StreamError};
use axum::routing::any;
use axum::Router;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Shared state for the axum handlers.
#[derive(Clone)]
pub struct ServerState {
    pub(crate) manager: Arc<BufferManager>,
    pub(crate) config: watch::Receiver<RelayConfig>,
}

impl ServerState {
    pub fn new(manager: Arc<BufferManager>, config: watch::Receiver<RelayConfig>) -> Self {
        Self { manager, config }
    }
}

/// Build the relay router: the stream endpoint at `/`, the snapshot
/// endpoint at `/snapshot`, 404 for everything else. Both endpoints accept
/// only GET and HEAD.
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/", any(stream_endpoint))
        .route("/snapshot", any(snapshot_endpoint))
        .fallback(not_found)
        .with_state(state)
}

/// HTTP front end serving the relayed webcam stream.
pub struct RelayServer {
    bind_addr: String,
    state: ServerState,
}

impl RelayServer {
    pub fn new(
        bind_addr: String,
        manager: Arc<BufferManager>,
        config: watch::Receiver<RelayConfig>,
    ) -> Self {
        Self {
            bind_addr,
            state: ServerState::new(manager, config),
        }
    }

    /// Bind and serve until the process is stopped.
    pub async fn serve(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| StreamError::BindFailed {
                address: self.bind_addr.clone(),
                source: e,
            })?;

        info!("relay listening on {}", self.bind_addr);

        axum::serve(listener, router(self.state))
            .await
            .map_err(|e| StreamError::Serve {
                details: e.to_string(),
            })?;
        Ok(())
    }
}
