pub mod local_manager;
pub mod meeting_instance;
pub mod port_allocator;
pub mod process_manager;
pub mod relay;
pub mod stats;
pub mod status;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::{
    config::SdkConfig,
    models::{JoinMeetingRequest, MeetingSummary},
    sdk::MeetingConfig,
    Result,
};

pub use local_manager::LocalMeetingManager;
pub use meeting_instance::MeetingInstance;
pub use port_allocator::PortAllocator;
pub use process_manager::{ProcessManager, WorkerProcess};
pub use stats::{MeetingStats, StatsRecorder};
pub use status::{MeetingStatus, StatusCell};

/// Interface commune des gestionnaires de meetings (in-process ou un worker par meeting)
#[async_trait]
pub trait MeetingManager: Send + Sync {
    async fn join_meeting(&self, request: JoinMeetingRequest) -> Result<()>;

    async fn leave_meeting(&self, meeting_id: &str) -> Result<()>;

    fn list_meetings(&self) -> Vec<MeetingSummary>;

    fn meeting_status(&self, meeting_id: &str) -> Result<MeetingStatus>;

    fn get_meeting_stats(&self, meeting_id: &str) -> Result<MeetingStats>;

    fn get_all_stats(&self) -> HashMap<String, MeetingStats>;

    fn meeting_count(&self) -> usize;

    async fn shutdown(&self);
}

/// Construit la configuration native à partir d'une requête et des credentials serveur
pub fn meeting_config(request: &JoinMeetingRequest, sdk: &SdkConfig) -> MeetingConfig {
    MeetingConfig {
        meeting_id: request.meeting_id.trim().to_string(),
        password: request.password.clone(),
        display_name: request.display_name.clone(),
        join_token: request.join_token.clone(),
        sdk_key: sdk.key.clone(),
        sdk_secret: sdk.secret.clone(),
    }
}
