//! Frontière avec le SDK de meeting natif.
//!
//! Le SDK n'est consommé qu'à travers `MeetingCapability` ; chaque session vit sur
//! un thread dédié (`SdkThread`) et ses callbacks audio passent par un
//! `CallbackRegistry` indexé par handle opaque.

pub mod callbacks;
pub mod simulated;
pub mod thread;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::services::MeetingStatus;
use crate::Result;

pub use callbacks::{CallbackRegistry, SessionHandle};
pub use simulated::SimulatedCapability;
pub use thread::SdkThread;

/// Handler invoqué sur le thread du SDK : `(type_code, speaker_id, pcm)`
pub type AudioHandler = Arc<dyn Fn(u64, u64, &[u8]) + Send + Sync>;

/// Paramètres de connexion à un meeting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeetingConfig {
    pub meeting_id: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub join_token: String,
    #[serde(default)]
    pub sdk_key: String,
    #[serde(default)]
    pub sdk_secret: String,
}

/// Capacité native : fabrique de sessions
pub trait MeetingCapability: Send + Sync {
    fn create_session(&self, config: &MeetingConfig) -> Result<Box<dyn MeetingSession>>;
}

/// Session native. Toujours manipulée depuis le thread SDK qui la possède.
pub trait MeetingSession: Send {
    fn status(&self) -> MeetingStatus;

    fn register_audio_callback(&mut self, handler: AudioHandler) -> Result<()>;

    fn leave(&mut self) -> Result<()>;
}
