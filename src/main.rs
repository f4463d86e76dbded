use std::sync::Arc;

use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod handler;
mod media;
mod registry;
mod session;

use api::AppState;
use media::engine::WebRtcEngine;
use media::ports::PortAllocator;
use registry::SessionRegistry;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("webrtc_restream", log::LevelFilter::Debug)
        .init();
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    let config = config::config();
    let (port_min, port_max) = config.port_range();

    let allocator = match PortAllocator::new(port_min, port_max) {
        Ok(allocator) => Arc::new(allocator),
        Err(e) => {
            log::error!("Config: {}", e);
            std::process::exit(1);
        }
    };

    let state = AppState {
        registry: Arc::new(SessionRegistry::new()),
        allocator,
        engine: Arc::new(WebRtcEngine::new()),
    };

    let cancel = CancellationToken::new();
    api::start_api_server(state, cancel.clone());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    std::process::exit(0);
}
