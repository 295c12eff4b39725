use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::audio::bus::unix_millis;

/// Compteurs d'un meeting. Les temps sont en millisecondes unix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeetingStats {
    pub start_time: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub bytes_received: u64,
    pub last_frame_time: Option<u64>,
}

/// Stats d'un meeting sous leur propre verrou, distinct des compteurs du bus
#[derive(Debug)]
pub struct StatsRecorder {
    inner: Mutex<MeetingStats>,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MeetingStats {
                start_time: unix_millis(SystemTime::now()),
                ..MeetingStats::default()
            }),
        }
    }

    /// Enregistre une frame reçue ; `delivered` est le résultat du publish
    pub fn record_frame(&self, bytes: usize, delivered: bool) {
        let mut stats = self.inner.lock();
        stats.frames_received += 1;
        stats.bytes_received += bytes as u64;
        stats.last_frame_time = Some(unix_millis(SystemTime::now()));
        if !delivered {
            stats.frames_dropped += 1;
        }
    }

    /// Packet perdu avant d'atteindre le bus (file d'entrée pleine)
    pub fn record_drop(&self) {
        self.inner.lock().frames_dropped += 1;
    }

    pub fn snapshot(&self) -> MeetingStats {
        self.inner.lock().clone()
    }
}

impl Default for StatsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_frames() {
        let recorder = StatsRecorder::new();
        assert!(recorder.snapshot().last_frame_time.is_none());

        recorder.record_frame(640, true);
        recorder.record_frame(640, false);
        recorder.record_drop();

        let stats = recorder.snapshot();
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.bytes_received, 1280);
        assert_eq!(stats.frames_dropped, 2);
        assert!(stats.last_frame_time.unwrap() >= stats.start_time);
    }
}
