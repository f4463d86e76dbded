use std::sync::Arc;

use anyhow::Context;
use axum::{Router, routing::get};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::handler;
use crate::media::engine::RtcEngine;
use crate::media::ports::PortAllocator;
use crate::registry::SessionRegistry;

/// Shared state behind every connection: the only process-wide mutable
/// pieces are the registry and the allocator pool, both serialized
/// internally.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub allocator: Arc<PortAllocator>,
    pub engine: Arc<dyn RtcEngine>,
}

pub(crate) fn start_api_server(state: AppState, cancel: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = serve(state, cancel.clone()).await {
            log::error!("API server: {:#}", e);
            cancel.cancel();
        }
    });
}

async fn serve(state: AppState, cancel: CancellationToken) -> anyhow::Result<()> {
    let bind_addr = crate::config::config().bind_addr();
    let app = Router::new()
        .route("/ws", get(handler::signaling::ws_handler))
        .nest("/session", handler::session_api::session_router())
        .with_state(state);

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("bind {}", bind_addr))?;
    log::info!("API server started on {}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await?;
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("Shutting down API server...");
}
