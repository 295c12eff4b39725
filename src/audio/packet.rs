use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::audio::{AudioFrame, AudioType};
use crate::{Error, Result};

/// Longueur maximale d'une ligne NDJSON acceptée depuis un worker (1 MiB)
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Packet audio tel qu'il circule entre un worker et le superviseur :
/// un objet JSON par ligne, `{"type":1,"speaker_id":42,"data":"<base64>"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerPacket {
    #[serde(rename = "type")]
    pub audio_type: u64,
    pub speaker_id: u64,
    #[serde(serialize_with = "serialize_base64", deserialize_with = "deserialize_base64")]
    pub data: Bytes,
}

impl WorkerPacket {
    /// Sérialise le packet en une ligne terminée par `\n`
    pub fn to_line(&self) -> Result<Bytes> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(Bytes::from(line))
    }

    /// Désérialise une ligne (sans le `\n`)
    pub fn from_line(line: &[u8]) -> Result<Self> {
        serde_json::from_slice(line)
            .map_err(|e| Error::ProtocolViolation(format!("Malformed audio packet: {}", e)))
    }

    pub fn into_frame(self) -> Result<AudioFrame> {
        let audio_type = AudioType::from_code(self.audio_type).ok_or_else(|| {
            Error::ProtocolViolation(format!("Unknown audio type code {}", self.audio_type))
        })?;
        Ok(AudioFrame::new(audio_type, self.speaker_id, self.data))
    }
}

impl From<&AudioFrame> for WorkerPacket {
    fn from(frame: &AudioFrame) -> Self {
        Self {
            audio_type: frame.audio_type.code(),
            speaker_id: frame.speaker_id,
            data: frame.payload.clone(),
        }
    }
}

fn serialize_base64<S: Serializer>(data: &Bytes, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(data))
}

fn deserialize_base64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Bytes, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded.as_bytes())
        .map(Bytes::from)
        .map_err(serde::de::Error::custom)
}

/// Découpe un flux d'octets arbitrairement fragmenté en lignes complètes
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: BytesMut,
    discarding: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ajoute un chunk reçu du réseau
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Renvoie la prochaine ligne complète non vide, ou `None` s'il faut plus de données.
    /// Une ligne dépassant `MAX_LINE_LENGTH` est signalée une fois puis ignorée.
    pub fn next_line(&mut self) -> Option<Result<Bytes>> {
        loop {
            match self.buffer.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    let mut line = self.buffer.split_to(pos + 1);
                    line.truncate(pos);
                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }
                    if line.len() > MAX_LINE_LENGTH {
                        return Some(Err(Error::ProtocolViolation(format!(
                            "Audio packet line exceeds {} bytes",
                            MAX_LINE_LENGTH
                        ))));
                    }
                    if line.last() == Some(&b'\r') {
                        line.truncate(line.len() - 1);
                    }
                    if line.is_empty() {
                        continue;
                    }
                    return Some(Ok(line.freeze()));
                }
                None if self.buffer.len() > MAX_LINE_LENGTH => {
                    self.buffer.clear();
                    if self.discarding {
                        return None;
                    }
                    self.discarding = true;
                    return Some(Err(Error::ProtocolViolation(format!(
                        "Audio packet line exceeds {} bytes",
                        MAX_LINE_LENGTH
                    ))));
                }
                None => return None,
            }
        }
    }
}
