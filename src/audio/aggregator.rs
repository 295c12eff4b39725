use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;

use crate::audio::{encode_wire_frame, AudioFrame, AudioType};

/// Accumule les payloads par (speaker, type) entre deux flush
#[derive(Debug, Default)]
pub struct FrameAggregator {
    buffers: BTreeMap<(u64, AudioType), BytesMut>,
}

impl FrameAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: &AudioFrame) {
        self.buffers
            .entry((frame.speaker_id, frame.audio_type))
            .or_default()
            .extend_from_slice(&frame.payload);
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.values().all(|b| b.is_empty())
    }

    /// Une frame binaire par buffer non vide ; les buffers sont vidés
    pub fn drain(&mut self) -> Vec<Bytes> {
        let mut frames = Vec::new();
        for ((speaker_id, audio_type), buffer) in self.buffers.iter_mut() {
            if buffer.is_empty() {
                continue;
            }
            let payload = buffer.split();
            frames.push(encode_wire_frame(*audio_type, *speaker_id, &payload));
        }
        frames
    }
}
