use std::collections::HashSet;
use std::time::Duration;

use crate::{
    audio::{AudioType, SubscriberFilter},
    config::WebSocketConfig,
    Error, Result,
};

/// Per-connection settings derived from the path and query string
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub meeting_id: String,
    pub audio_types: HashSet<AudioType>,
    pub user_ids: HashSet<u64>,
    pub queue_size: usize,
    pub heartbeat_enabled: bool,
    pub heartbeat_interval: Duration,
}

impl ConnectionConfig {
    /// Parses repeated `type` and `user_id` parameters, plus optional `queue_size`
    /// and `heartbeat` overrides. Unknown values are rejected.
    pub fn from_params(
        meeting_id: &str,
        params: &[(String, String)],
        defaults: &WebSocketConfig,
    ) -> Result<Self> {
        let meeting_id = meeting_id.trim();
        if meeting_id.is_empty() {
            return Err(Error::ProtocolViolation("meeting_id is required".to_string()));
        }

        let mut config = Self {
            meeting_id: meeting_id.to_string(),
            audio_types: HashSet::new(),
            user_ids: HashSet::new(),
            queue_size: defaults.queue_size,
            heartbeat_enabled: defaults.heartbeat_interval_secs > 0,
            heartbeat_interval: defaults.heartbeat_interval(),
        };

        for (key, value) in params {
            match key.as_str() {
                "type" => {
                    let audio_type = AudioType::parse(value).ok_or_else(|| {
                        Error::ProtocolViolation(format!("invalid audio type: {}", value))
                    })?;
                    config.audio_types.insert(audio_type);
                }
                "user_id" => {
                    let user_id = value.parse::<u64>().map_err(|_| {
                        Error::ProtocolViolation(format!("invalid user_id: {}", value))
                    })?;
                    config.user_ids.insert(user_id);
                }
                "queue_size" => {
                    config.queue_size = value
                        .parse::<usize>()
                        .ok()
                        .filter(|size| *size > 0)
                        .ok_or_else(|| {
                            Error::ProtocolViolation(format!("invalid queue_size: {}", value))
                        })?;
                }
                "heartbeat" => {
                    config.heartbeat_enabled = value.parse::<bool>().map_err(|_| {
                        Error::ProtocolViolation(format!("invalid heartbeat flag: {}", value))
                    })?;
                }
                _ => {}
            }
        }

        Ok(config)
    }

    pub fn filter(&self) -> SubscriberFilter {
        SubscriberFilter::for_meeting(self.meeting_id.clone())
            .with_audio_types(self.audio_types.iter().copied())
            .with_speakers(self.user_ids.iter().copied())
    }
}
