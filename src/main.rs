#![forbid(unsafe_code)]

use anyhow::Result;
use liveclass_sfu::config::{self, EngineKind};
use liveclass_sfu::media::{MediaEngine, MediasoupEngine, MockEngine};
use liveclass_sfu::metrics::ServerMetrics;
use liveclass_sfu::room::RoomManager;
use liveclass_sfu::signaling::SignalingServer;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "liveclass_sfu=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("liveclass-sfu - Starting server");

    let config = config::load()?;

    let transport = &config.media.webrtc_transport_config;
    match &transport.announced_address {
        Some(ip) => info!("Announcing {} in ICE candidates", ip),
        None => warn!("ANNOUNCED_IP not set, peers behind NAT will see {}", transport.listen_ip),
    }
    if let Some(turn) = &config.ice_servers.turn {
        info!("TURN configured: {} URL(s)", turn.urls.len());
    }

    // The worker starts lazily with the first room
    let engine: Arc<dyn MediaEngine> = match config.engine {
        EngineKind::Mediasoup => Arc::new(MediasoupEngine::new(config.media.worker_config.clone())),
        EngineKind::Mock => {
            warn!("MEDIA_ENGINE=mock, no media will flow");
            Arc::new(MockEngine::new())
        }
    };

    let metrics = ServerMetrics::new();
    let room_manager = Arc::new(RoomManager::new(
        engine,
        config.media.clone(),
        config.engine_timeout,
        metrics.clone(),
    ));

    let signaling_server = SignalingServer::new(room_manager.clone(), &config, metrics);
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down...");
    };

    if let Err(e) = signaling_server.serve(listener, shutdown).await {
        tracing::error!("Signaling server error: {}", e);
    }

    room_manager.shutdown();
    info!("Server shutdown complete");
    Ok(())
}
