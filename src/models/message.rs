use serde::{Deserialize, Serialize};

/// Sample format announced to streaming clients
pub const SAMPLE_FORMAT_S16LE: &str = "s16le";

// Server to client control messages (JSON text frames)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    AudioFormat {
        sample_rate: u32,
        channels: u16,
        sample_format: String,
    },
    Error {
        error: String,
        code: u16,
    },
    Heartbeat {
        timestamp: u64,
    },
}

impl ControlMessage {
    pub fn audio_format(sample_rate: u32, channels: u16) -> Self {
        Self::AudioFormat {
            sample_rate,
            channels,
            sample_format: SAMPLE_FORMAT_S16LE.to_string(),
        }
    }

    pub fn error(error: impl Into<String>, code: u16) -> Self {
        Self::Error {
            error: error.into(),
            code,
        }
    }

    pub fn heartbeat() -> Self {
        Self::Heartbeat {
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
