use axum::{routing::get, Router};
use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    audio::AudioBus,
    config::{Config, ManagerMode},
    handlers::{api_router, ApiHandlers},
    networking::StreamingHandler,
    sdk::SimulatedCapability,
    services::{LocalMeetingManager, MeetingManager, ProcessManager},
    Result,
};

pub struct Server {
    config: Config,
    bus: Arc<AudioBus>,
    manager: Arc<dyn MeetingManager>,
}

impl Server {
    pub fn new(config: Config) -> Result<Self> {
        let bus = Arc::new(AudioBus::new());

        let manager: Arc<dyn MeetingManager> = match config.workers.mode {
            ManagerMode::Process => {
                info!(
                    "Meetings run in worker processes (ports {}-{})",
                    config.workers.base_port, config.workers.max_port
                );
                Arc::new(ProcessManager::new(config.clone(), bus.clone())?)
            }
            ManagerMode::InProcess => {
                info!("Meetings run inside the server process");
                let capability = Arc::new(SimulatedCapability::from_config(&config));
                Arc::new(LocalMeetingManager::new(config.clone(), capability, bus.clone()))
            }
        };

        Ok(Self {
            config,
            bus,
            manager,
        })
    }

    pub fn bus(&self) -> &Arc<AudioBus> {
        &self.bus
    }

    pub fn manager(&self) -> &Arc<dyn MeetingManager> {
        &self.manager
    }

    /// Serves until `shutdown` resolves, then stops every meeting and closes the bus.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send) -> Result<()> {
        let app = build_router(self.manager.clone(), self.bus.clone(), &self.config);

        let http_addr = self.config.http_addr()?;
        info!("Starting HTTP server on {}", http_addr);
        let listener = TcpListener::bind(http_addr).await?;

        let stop = CancellationToken::new();
        let sweep = spawn_cleanup_sweep(
            self.bus.clone(),
            self.config.bus.cleanup_interval(),
            self.config.bus.subscriber_timeout(),
            stop.clone(),
        );

        let mut server = tokio::spawn(
            axum::serve(listener, app)
                .with_graceful_shutdown(stop.clone().cancelled_owned())
                .into_future(),
        );

        let early_exit = tokio::select! {
            joined = &mut server => Some(joined),
            _ = shutdown => None,
        };

        info!("Shutting down server...");
        // Les sessions WebSocket upgradées ne sont pas suivies par le serveur HTTP:
        // fermer le bus termine leurs boucles d'écriture.
        self.manager.shutdown().await;
        self.bus.shutdown();
        stop.cancel();
        let _ = sweep.await;

        let joined = match early_exit {
            Some(joined) => joined,
            None => server.await,
        };
        match joined {
            Ok(served) => served?,
            Err(e) => tracing::error!("HTTP server task failed: {}", e),
        }

        info!("Server shutdown complete");
        Ok(())
    }
}

/// REST API plus the streaming endpoint, with the CORS and tracing layers.
pub fn build_router(manager: Arc<dyn MeetingManager>, bus: Arc<AudioBus>, config: &Config) -> Router {
    let streaming = Arc::new(StreamingHandler::new(
        bus,
        config.audio.clone(),
        config.websocket.clone(),
    ));

    let ws_router = Router::new()
        .route("/ws/audio/:meeting_id", get(StreamingHandler::handle_upgrade))
        .with_state(streaming);

    api_router(Arc::new(ApiHandlers::new(manager)))
        .merge(ws_router)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

/// Periodically evicts disconnected or idle bus subscribers.
pub fn spawn_cleanup_sweep(
    bus: Arc<AudioBus>,
    interval: Duration,
    timeout: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = interval.max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = bus.cleanup_inactive_subscribers(timeout);
                    if evicted > 0 {
                        info!("🧹 Evicted {} inactive subscribers", evicted);
                    }
                }
            }
        }
    })
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down gracefully"),
        _ = terminate => info!("Received SIGTERM, shutting down gracefully"),
    }
}
