use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::{
    models::{
        HealthResponse, JoinMeetingRequest, MeetingDetail, MeetingSummary, StatusResponse,
        WorkerReadyNotification,
    },
    services::MeetingManager,
    Error,
};

pub struct ApiHandlers {
    manager: Arc<dyn MeetingManager>,
}

impl ApiHandlers {
    pub fn new(manager: Arc<dyn MeetingManager>) -> Self {
        Self { manager }
    }

    pub async fn join_meeting(
        State(handlers): State<Arc<Self>>,
        Json(request): Json<JoinMeetingRequest>,
    ) -> Result<(StatusCode, Json<StatusResponse>), (StatusCode, String)> {
        if request.meeting_id.trim().is_empty() {
            return Err((StatusCode::BAD_REQUEST, "Meeting ID is required".to_string()));
        }

        tracing::info!("📞 Received join request for meeting: {}", request.meeting_id);
        match handlers.manager.join_meeting(request).await {
            Ok(()) => Ok((StatusCode::ACCEPTED, Json(StatusResponse::new("joining")))),
            Err(e) => {
                tracing::error!("❌ Failed to join meeting: {}", e);
                Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
            }
        }
    }

    pub async fn leave_meeting(
        State(handlers): State<Arc<Self>>,
        Path(meeting_id): Path<String>,
    ) -> Result<Json<StatusResponse>, (StatusCode, String)> {
        match handlers.manager.leave_meeting(&meeting_id).await {
            Ok(()) => {
                tracing::info!("✅ Left meeting {}", meeting_id);
                Ok(Json(StatusResponse::new("left")))
            }
            Err(e) => Err((StatusCode::NOT_FOUND, e.to_string())),
        }
    }

    pub async fn list_meetings(State(handlers): State<Arc<Self>>) -> Json<Vec<MeetingSummary>> {
        Json(handlers.manager.list_meetings())
    }

    pub async fn get_meeting(
        State(handlers): State<Arc<Self>>,
        Path(meeting_id): Path<String>,
    ) -> Result<Json<MeetingDetail>, (StatusCode, String)> {
        let lookup = handlers.manager.meeting_status(&meeting_id).and_then(|status| {
            handlers
                .manager
                .get_meeting_stats(&meeting_id)
                .map(|stats| (status, stats))
        });

        match lookup {
            Ok((status, stats)) => Ok(Json(MeetingDetail {
                meeting_id,
                status,
                stats,
            })),
            Err(Error::NotFound(_)) => Err((StatusCode::NOT_FOUND, "Meeting not found".to_string())),
            Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
        }
    }

    pub async fn health(State(handlers): State<Arc<Self>>) -> Json<HealthResponse> {
        Json(HealthResponse {
            status: "ok".to_string(),
            meeting_count: handlers.manager.meeting_count(),
        })
    }

    pub async fn worker_ready(Json(notification): Json<WorkerReadyNotification>) -> Json<StatusResponse> {
        tracing::info!(
            meeting_id = %notification.meeting_id,
            worker_port = notification.worker_port,
            pid = notification.pid,
            "Worker reported {}",
            notification.status
        );
        Json(StatusResponse::new("ok"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioBus;
    use crate::config::Config;
    use crate::handlers::api_router;
    use crate::sdk::SimulatedCapability;
    use crate::services::LocalMeetingManager;
    use axum_test::TestServer;
    use serde_json::json;

    fn server() -> TestServer {
        let config = Config::default();
        let capability = Arc::new(SimulatedCapability::from_config(&config));
        let manager: Arc<dyn MeetingManager> = Arc::new(LocalMeetingManager::new(
            config,
            capability,
            Arc::new(AudioBus::new()),
        ));
        TestServer::new(api_router(Arc::new(ApiHandlers::new(manager)))).unwrap()
    }

    #[tokio::test]
    async fn test_join_requires_meeting_id() {
        let server = server();
        let response = server
            .post("/api/meetings")
            .json(&json!({ "meeting_id": "  ", "display_name": "bot" }))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_meeting_lifecycle() {
        let server = server();

        let response = server
            .post("/api/meetings")
            .json(&json!({ "meeting_id": "m1", "display_name": "bot" }))
            .await;
        response.assert_status(StatusCode::ACCEPTED);
        response.assert_json(&json!({ "status": "joining" }));

        let duplicate = server
            .post("/api/meetings")
            .json(&json!({ "meeting_id": "m1" }))
            .await;
        duplicate.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        assert!(duplicate.text().contains("already exists"));

        let list: Vec<serde_json::Value> = server.get("/api/meetings").await.json();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["meeting_id"], "m1");

        let detail: serde_json::Value = server.get("/api/meetings/m1").await.json();
        assert_eq!(detail["meeting_id"], "m1");
        assert!(detail["stats"]["start_time"].as_u64().unwrap() > 0);

        server
            .get("/health")
            .await
            .assert_json(&json!({ "status": "ok", "meeting_count": 1 }));

        let left = server.delete("/api/meetings/m1").await;
        left.assert_status_ok();
        left.assert_json(&json!({ "status": "left" }));

        server.get("/api/meetings/m1").await.assert_status(StatusCode::NOT_FOUND);
        server.delete("/api/meetings/m1").await.assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_worker_ready_callback() {
        let server = server();
        let response = server
            .post("/api/workers/ready")
            .json(&json!({ "meeting_id": "m1", "status": "ready", "worker_port": 9001, "pid": 42 }))
            .await;
        response.assert_status_ok();
        response.assert_json(&json!({ "status": "ok" }));
    }
}
