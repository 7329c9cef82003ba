//! Binary frame codec for the provider's bidirectional stream.
//!
//! Every frame is a 4-byte header followed by a length-prefixed payload:
//!
//! ```text
//! byte 0: version (high nibble) | frame type (low nibble)
//! byte 1: flags
//! byte 2: serialization (high nibble) | compression (low nibble)
//! byte 3: reserved (zero)
//! bytes 4..8: payload length, u32 big-endian
//! bytes 8..:  payload
//! ```
//!
//! Control frames (`SessionStart`, `TurnText`, `Status`) carry JSON
//! payloads; `AudioChunk` carries raw codec bytes.

use crate::error::SynthError;
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u8 = 0x1;

/// Provider status code that terminates a session cleanly. Anything else
/// in a `Status` frame is an error, classified transient or fatal by the
/// configured code set.
pub const STATUS_FINAL: i32 = 20_000_000;

const HEADER_LEN: usize = 4;
const LEN_PREFIX: usize = 4;

/// Frames exchanged with the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    SessionStart,
    TurnText,
    AudioChunk,
    Status,
}

impl FrameType {
    fn to_nibble(self) -> u8 {
        match self {
            Self::SessionStart => 0x1,
            Self::TurnText => 0x2,
            Self::AudioChunk => 0xB,
            Self::Status => 0xF,
        }
    }

    fn from_nibble(n: u8) -> Result<Self, SynthError> {
        match n {
            0x1 => Ok(Self::SessionStart),
            0x2 => Ok(Self::TurnText),
            0xB => Ok(Self::AudioChunk),
            0xF => Ok(Self::Status),
            other => Err(SynthError::Protocol(format!(
                "unknown frame type 0x{other:X}"
            ))),
        }
    }
}

/// Payload encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serialization {
    Raw,
    Json,
}

impl Serialization {
    fn to_nibble(self) -> u8 {
        match self {
            Self::Raw => 0x0,
            Self::Json => 0x1,
        }
    }

    fn from_nibble(n: u8) -> Result<Self, SynthError> {
        match n {
            0x0 => Ok(Self::Raw),
            0x1 => Ok(Self::Json),
            other => Err(SynthError::Protocol(format!(
                "unknown serialization 0x{other:X}"
            ))),
        }
    }
}

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub flags: u8,
    pub serialization: Serialization,
    pub compression: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn json(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            flags: 0,
            serialization: Serialization::Json,
            compression: 0,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + LEN_PREFIX + self.payload.len());
        buf.push((PROTOCOL_VERSION << 4) | self.frame_type.to_nibble());
        buf.push(self.flags);
        buf.push((self.serialization.to_nibble() << 4) | (self.compression & 0x0F));
        buf.push(0x00);
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, SynthError> {
        if data.len() < HEADER_LEN + LEN_PREFIX {
            return Err(SynthError::Protocol(format!(
                "frame too short: {} bytes",
                data.len()
            )));
        }
        let version = data[0] >> 4;
        if version != PROTOCOL_VERSION {
            return Err(SynthError::Protocol(format!(
                "unsupported protocol version {version}"
            )));
        }
        let frame_type = FrameType::from_nibble(data[0] & 0x0F)?;
        let flags = data[1];
        let serialization = Serialization::from_nibble(data[2] >> 4)?;
        let compression = data[2] & 0x0F;
        let declared = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        let body = &data[HEADER_LEN + LEN_PREFIX..];
        if body.len() != declared {
            return Err(SynthError::Protocol(format!(
                "payload length mismatch: declared {declared}, got {}",
                body.len()
            )));
        }
        Ok(Self {
            frame_type,
            flags,
            serialization,
            compression,
            payload: body.to_vec(),
        })
    }
}

// ── Payload schemas ────────────────────────────────────────────────

/// Voice assignment for one speaker within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerVoice {
    pub speaker: u8,
    pub voice: String,
}

/// Output format negotiated at session start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioFormat {
    pub codec: String,
    pub sample_rate: u32,
}

/// `SessionStart` control payload: session id, voices for every speaker in
/// the segment, and format parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartPayload {
    pub session_id: String,
    pub speakers: Vec<SpeakerVoice>,
    pub format: AudioFormat,
}

/// `TurnText` data payload. `is_last` is true only on the final turn of
/// the segment and tells the provider to flush and finish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnTextPayload {
    pub speaker: u8,
    pub text: String,
    pub is_last: bool,
}

/// `Status` payload from the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    pub code: i32,
    #[serde(default)]
    pub message: String,
}
