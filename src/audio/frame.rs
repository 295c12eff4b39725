use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Taille du header binaire : type (u64 LE) + speaker id (u64 LE)
pub const BINARY_FRAME_HEADER_SIZE: usize = 16;

/// Classification d'un packet audio, codes identiques à ceux du SDK natif
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioType {
    /// Audio mixé de tous les participants
    Mixed = 0,
    /// Audio d'un seul participant
    OneWay = 1,
    /// Audio du partage d'écran
    Share = 2,
}

impl AudioType {
    pub fn code(self) -> u64 {
        self as u64
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Self::Mixed),
            1 => Some(Self::OneWay),
            2 => Some(Self::Share),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mixed => "mixed",
            Self::OneWay => "one_way",
            Self::Share => "share",
        }
    }

    /// Nom utilisé dans les paramètres de requête (`?type=one_way`)
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "mixed" => Some(Self::Mixed),
            "one_way" => Some(Self::OneWay),
            "share" => Some(Self::Share),
            _ => None,
        }
    }
}

impl fmt::Display for AudioType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Packet audio PCM (S16LE) d'un speaker. Le payload est partagé, jamais modifié.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub audio_type: AudioType,
    pub speaker_id: u64,
    pub payload: Bytes,
}

impl AudioFrame {
    pub fn new(audio_type: AudioType, speaker_id: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            audio_type,
            speaker_id,
            payload: payload.into(),
        }
    }

    /// Sérialise en frame binaire : header de 16 bytes suivi du payload brut
    pub fn encode(&self) -> Bytes {
        encode_wire_frame(self.audio_type, self.speaker_id, &self.payload)
    }

    /// Désérialise une frame binaire
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BINARY_FRAME_HEADER_SIZE {
            return Err(Error::ProtocolViolation(format!(
                "Frame too small: {} bytes, header needs {}",
                bytes.len(),
                BINARY_FRAME_HEADER_SIZE
            )));
        }
        let (header, payload) = bytes.split_at(BINARY_FRAME_HEADER_SIZE);

        let (type_bytes, speaker_bytes) = header.split_at(8);
        let type_code = u64::from_le_bytes(to_array(type_bytes)?);
        let speaker_id = u64::from_le_bytes(to_array(speaker_bytes)?);

        let audio_type = AudioType::from_code(type_code)
            .ok_or_else(|| Error::ProtocolViolation(format!("Unknown audio type code {}", type_code)))?;

        Ok(Self {
            audio_type,
            speaker_id,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Taille totale une fois encodée
    pub fn encoded_len(&self) -> usize {
        BINARY_FRAME_HEADER_SIZE + self.payload.len()
    }
}

/// Encode un header et un payload déjà agrégé sans construire d'`AudioFrame`
pub fn encode_wire_frame(audio_type: AudioType, speaker_id: u64, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(BINARY_FRAME_HEADER_SIZE + payload.len());
    buf.put_u64_le(audio_type.code());
    buf.put_u64_le(speaker_id);
    buf.extend_from_slice(payload);
    buf.freeze()
}

fn to_array(bytes: &[u8]) -> Result<[u8; 8]> {
    bytes
        .try_into()
        .map_err(|_| Error::ProtocolViolation("Truncated frame header".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_type_names() {
        assert_eq!(AudioType::Mixed.to_string(), "mixed");
        assert_eq!(AudioType::OneWay.to_string(), "one_way");
        assert_eq!(AudioType::Share.to_string(), "share");
        assert_eq!(AudioType::parse("one_way"), Some(AudioType::OneWay));
        assert_eq!(AudioType::parse("video"), None);
        assert_eq!(AudioType::from_code(999), None);
    }

    #[test]
    fn test_encode_layout() {
        let frame = AudioFrame::new(AudioType::OneWay, 12345, vec![1, 2, 3, 4, 5]);
        let encoded = frame.encode();

        assert_eq!(encoded.len(), BINARY_FRAME_HEADER_SIZE + 5);
        assert_eq!(&encoded[0..8], &1u64.to_le_bytes());
        assert_eq!(&encoded[8..16], &12345u64.to_le_bytes());
        assert_eq!(&encoded[16..], &[1, 2, 3, 4, 5]);
        assert_eq!(frame.encoded_len(), encoded.len());
    }

    #[test]
    fn test_decode_payload_lengths() {
        for payload in [vec![], vec![7u8], (0..=255u8).collect::<Vec<_>>()] {
            let frame = AudioFrame::new(AudioType::Share, u64::MAX, payload.clone());
            let decoded = AudioFrame::decode(&frame.encode()).unwrap();

            assert_eq!(decoded.audio_type, AudioType::Share);
            assert_eq!(decoded.speaker_id, u64::MAX);
            assert_eq!(decoded.payload.as_ref(), payload.as_slice());
        }
    }

    #[test]
    fn test_header_only_frame_is_valid() {
        let encoded = encode_wire_frame(AudioType::Mixed, 0, &[]);
        assert_eq!(encoded.len(), BINARY_FRAME_HEADER_SIZE);

        let decoded = AudioFrame::decode(&encoded).unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_decode_rejects_short_and_unknown() {
        assert!(matches!(
            AudioFrame::decode(&[0u8; 15]),
            Err(Error::ProtocolViolation(_))
        ));

        let mut bytes = vec![0u8; BINARY_FRAME_HEADER_SIZE];
        bytes[0] = 9;
        assert!(matches!(
            AudioFrame::decode(&bytes),
            Err(Error::ProtocolViolation(_))
        ));
    }
}
