//! Runtime du sous-commande `worker` : un seul meeting, servi en HTTP au superviseur.

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    audio::{AudioBus, SubscriberFilter, SubscriptionGuard, WorkerPacket},
    config::{AudioConfig, SimulationConfig},
    models::{WorkerHealth, WorkerReadyNotification},
    sdk::{MeetingCapability, MeetingConfig, SimulatedCapability},
    server::shutdown_signal,
    services::{MeetingInstance, MeetingStats, MeetingStatus},
    Error, Result,
};

/// Variable d'environnement portant la configuration JSON du worker
pub const WORKER_CONFIG_ENV: &str = "MEETING_AUDIO_WORKER_CONFIG";

/// Profondeur de file d'un flux `/audio`
const AUDIO_STREAM_QUEUE_SIZE: usize = 1000;

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration transmise par le superviseur
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(flatten)]
    pub meeting: MeetingConfig,
    pub worker_port: u16,
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

impl WorkerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_env() -> Result<Self> {
        let json = std::env::var(WORKER_CONFIG_ENV).map_err(|_| {
            Error::Internal(format!("{} is not set and no --config was given", WORKER_CONFIG_ENV))
        })?;
        Self::from_json(&json)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_host, self.worker_port)
            .parse()
            .map_err(|e| Error::Internal(format!("Invalid worker address: {}", e)))
    }
}

/// État partagé par les routes du worker
pub struct WorkerState {
    meeting_id: String,
    instance: Arc<MeetingInstance>,
    bus: Arc<AudioBus>,
}

impl WorkerState {
    pub fn new(meeting_id: String, instance: Arc<MeetingInstance>, bus: Arc<AudioBus>) -> Self {
        Self {
            meeting_id,
            instance,
            bus,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerStatusResponse {
    pub meeting_id: String,
    pub status: MeetingStatus,
}

pub fn worker_router(state: Arc<WorkerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/stats", get(stats))
        .route("/audio", get(stream_audio))
        .with_state(state)
}

async fn health() -> Json<WorkerHealth> {
    Json(WorkerHealth {
        status: "ok".to_string(),
        pid: std::process::id(),
    })
}

async fn status(State(state): State<Arc<WorkerState>>) -> Json<WorkerStatusResponse> {
    Json(WorkerStatusResponse {
        meeting_id: state.meeting_id.clone(),
        status: state.instance.status(),
    })
}

async fn stats(State(state): State<Arc<WorkerState>>) -> Json<MeetingStats> {
    Json(state.instance.stats())
}

/// Flux NDJSON chunké, une ligne par packet. Le désabonnement suit la fin de la réponse.
async fn stream_audio(State(state): State<Arc<WorkerState>>) -> Response {
    let subscriber_id = format!("worker-{}-{}", state.meeting_id, Uuid::new_v4());
    let (_, receiver) = state.bus.subscribe_with(
        subscriber_id.clone(),
        SubscriberFilter::for_meeting(state.meeting_id.clone()),
        AUDIO_STREAM_QUEUE_SIZE,
    );
    let guard = SubscriptionGuard::new(state.bus.clone(), subscriber_id);
    tracing::info!(meeting_id = %state.meeting_id, subscriber = %guard.id(), "Audio stream started");

    let lines = futures_util::stream::unfold((receiver, guard), |(mut receiver, guard)| async move {
        let frame = receiver.recv().await?;
        let line = WorkerPacket::from(&frame)
            .to_line()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()));
        Some((line, (receiver, guard)))
    });

    match Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(lines))
    {
        Ok(response) => response,
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Rejoint le meeting puis sert la surface HTTP jusqu'à SIGTERM / Ctrl+C
pub async fn run(config: WorkerConfig) -> Result<()> {
    let capability: Arc<dyn MeetingCapability> = Arc::new(SimulatedCapability::new(
        config.audio.sample_rate,
        &config.simulation,
    ));
    run_with_capability(config, capability, shutdown_signal()).await
}

pub async fn run_with_capability(
    config: WorkerConfig,
    capability: Arc<dyn MeetingCapability>,
    shutdown: impl std::future::Future<Output = ()> + Send,
) -> Result<()> {
    let meeting_id = config.meeting.meeting_id.clone();
    let pid = std::process::id();
    tracing::info!(meeting_id = %meeting_id, port = config.worker_port, pid, "Starting meeting worker");

    // Le port est réservé avant le join, /health ne répond qu'une fois dans le meeting
    let listener = TcpListener::bind(config.listen_addr()?).await?;

    let bus = Arc::new(AudioBus::new());
    let instance = MeetingInstance::new(
        config.meeting.clone(),
        bus.clone(),
        config.audio.intake_queue_size,
    );
    instance.start(capability).await?;

    let state = Arc::new(WorkerState::new(meeting_id.clone(), instance.clone(), bus.clone()));
    let server_shutdown = CancellationToken::new();
    let server = tokio::spawn(
        axum::serve(listener, worker_router(state))
            .with_graceful_shutdown(server_shutdown.clone().cancelled_owned())
            .into_future(),
    );
    tracing::info!(meeting_id = %meeting_id, "Worker HTTP server listening on {}", config.listen_addr()?);

    tokio::spawn(notify_ready(config.clone(), pid));

    shutdown.await;
    tracing::info!(meeting_id = %meeting_id, "Shutting down worker...");

    instance.stop().await;
    // Termine les flux /audio en cours avant l'arrêt du serveur
    bus.shutdown();
    server_shutdown.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Worker HTTP server error: {}", e),
        Err(e) => tracing::error!("Worker HTTP server task failed: {}", e),
    }

    tracing::info!(meeting_id = %meeting_id, "Worker shutdown complete");
    Ok(())
}

async fn notify_ready(config: WorkerConfig, pid: u32) {
    let Some(url) = config.callback_url.as_deref() else {
        return;
    };

    let notification = WorkerReadyNotification {
        meeting_id: config.meeting.meeting_id.clone(),
        status: "ready".to_string(),
        worker_port: config.worker_port,
        pid,
    };

    let sent = reqwest::Client::new()
        .post(url)
        .timeout(CALLBACK_TIMEOUT)
        .json(&notification)
        .send()
        .await;

    match sent {
        Ok(response) if response.status().is_success() => {
            tracing::info!("Ready notification sent successfully")
        }
        Ok(response) => {
            tracing::warn!(status = %response.status(), "Ready notification was rejected")
        }
        Err(e) => tracing::warn!("Failed to send ready notification: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioFrame, AudioType, LineDecoder};
    use axum_test::TestServer;
    use futures_util::StreamExt;

    #[test]
    fn test_worker_config_json() {
        let config = WorkerConfig::from_json(
            r#"{"meeting_id":"m1","password":"pw","sdk_key":"k","sdk_secret":"s","worker_port":9001}"#,
        )
        .unwrap();

        assert_eq!(config.meeting.meeting_id, "m1");
        assert_eq!(config.meeting.password, "pw");
        assert_eq!(config.worker_port, 9001);
        assert_eq!(config.bind_host, "127.0.0.1");
        assert!(config.callback_url.is_none());
        assert_eq!(config.audio.sample_rate, 32000);
    }

    async fn started_state(meeting_id: &str) -> (Arc<WorkerState>, Arc<AudioBus>) {
        let bus = Arc::new(AudioBus::new());
        let meeting = MeetingConfig {
            meeting_id: meeting_id.to_string(),
            ..MeetingConfig::default()
        };
        let instance = MeetingInstance::new(meeting, bus.clone(), 100);
        let capability = Arc::new(SimulatedCapability::new(16000, &SimulationConfig::default()));
        instance.start(capability).await.unwrap();
        (
            Arc::new(WorkerState::new(meeting_id.to_string(), instance, bus.clone())),
            bus,
        )
    }

    #[tokio::test]
    async fn test_worker_status_endpoints() {
        let (state, _) = started_state("m1").await;
        let server = TestServer::new(worker_router(state.clone())).unwrap();

        let health: serde_json::Value = server.get("/health").await.json();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["pid"], std::process::id());

        let status: serde_json::Value = server.get("/status").await.json();
        assert_eq!(status["meeting_id"], "m1");

        let stats: serde_json::Value = server.get("/stats").await.json();
        assert!(stats["start_time"].as_u64().unwrap() > 0);

        state.instance.stop().await;
    }

    #[tokio::test]
    async fn test_audio_endpoint_streams_ndjson() {
        let (state, bus) = started_state("m1").await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, worker_router(state)).await.unwrap() });

        let response = reqwest::get(format!("http://{}/audio", addr)).await.unwrap();
        assert!(response.status().is_success());

        // Une frame d'un autre meeting ne doit jamais apparaître dans le flux
        bus.publish("other", &AudioFrame::new(AudioType::Share, 99, vec![0u8; 2]));

        let mut stream = response.bytes_stream();
        let mut decoder = LineDecoder::new();
        let packet = loop {
            if let Some(line) = decoder.next_line() {
                break WorkerPacket::from_line(&line.unwrap()).unwrap();
            }
            let chunk = tokio::time::timeout(Duration::from_secs(2), stream.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            decoder.push(&chunk);
        };

        assert_ne!(packet.speaker_id, 99);
        assert!(!packet.data.is_empty());
    }
}
