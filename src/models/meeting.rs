use serde::{Deserialize, Serialize};

use crate::services::{MeetingStats, MeetingStatus};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinMeetingRequest {
    #[serde(default)]
    pub meeting_id: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub join_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingSummary {
    pub meeting_id: String,
    pub status: MeetingStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingDetail {
    pub meeting_id: String,
    pub status: MeetingStatus,
    pub stats: MeetingStats,
}

/// Simple `{status: "..."}` acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub meeting_count: usize,
}

// Worker process surface

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub status: String,
    pub pid: u32,
}

/// Readiness callback posted by a worker once it has joined
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReadyNotification {
    pub meeting_id: String,
    pub status: String,
    pub worker_port: u16,
    pub pid: u32,
}
