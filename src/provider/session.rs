//! One bidirectional streaming session per segment.
//!
//! ## Protocol
//!
//! 1. **Connect** — WebSocket with `X-Api-App-Id` / `X-Api-Access-Token`
//!    and a signed per-session nonce.
//! 2. **SessionStart** — session id, voice assignments for the segment's
//!    speakers, codec and sample rate.
//! 3. **TurnText** per turn, `is_last` on the final one.
//! 4. **Receive** — collect `AudioChunk` payloads in order until a
//!    `Status` frame: FINAL closes cleanly, anything else is a provider
//!    error. Transport close before FINAL is a truncation.
//!
//! Three timeout budgets guard the session: connect, idle (gap between
//! frames), and total.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use super::frame::{
    AudioFormat, Frame, FrameType, SessionStartPayload, SpeakerVoice, StatusPayload,
    TurnTextPayload, STATUS_FINAL,
};
use super::SpeechSynthesizer;
use crate::config::ProviderConfig;
use crate::dialogue::{Segment, VoiceMap};
use crate::error::SynthError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An established provider connection, valid for exactly one segment.
pub struct ProviderSession {
    ws: WsStream,
    session_id: String,
    idle: Duration,
    deadline: Instant,
}

impl ProviderSession {
    /// Connect and authenticate. The nonce is fresh per session; the
    /// signature binds it to the static credentials.
    pub async fn connect(
        config: &ProviderConfig,
        session_id: String,
    ) -> Result<Self, SynthError> {
        let mut request = config
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| SynthError::Internal(format!("bad provider endpoint: {e}")))?;

        let nonce = Uuid::new_v4().to_string();
        let signature = sign_nonce(&config.app_id, &config.access_token, &nonce);
        let headers = request.headers_mut();
        for (name, value) in [
            ("X-Api-App-Id", config.app_id.as_str()),
            ("X-Api-Access-Token", config.access_token.as_str()),
            ("X-Api-Nonce", nonce.as_str()),
            ("X-Api-Signature", signature.as_str()),
        ] {
            headers.insert(
                name,
                value
                    .parse()
                    .map_err(|e| SynthError::Internal(format!("invalid header {name}: {e}")))?,
            );
        }

        let connect_budget = Duration::from_secs(config.connect_timeout_secs);
        let connected = timeout(connect_budget, connect_async(request))
            .await
            .map_err(|_| SynthError::Timeout("connect"))?;
        let (ws, _response) = connected.map_err(|e| {
            tracing::warn!(session_id = %session_id, error = %e, "provider connect failed");
            SynthError::Truncated
        })?;

        Ok(Self {
            ws,
            session_id,
            idle: Duration::from_secs(config.idle_timeout_secs),
            deadline: Instant::now() + Duration::from_secs(config.total_timeout_secs),
        })
    }

    /// Drive the full session for one segment and collect its audio.
    pub async fn run(
        mut self,
        segment: &Segment,
        voices: &VoiceMap,
        format: AudioFormat,
    ) -> Result<Vec<u8>, SynthError> {
        let speakers = segment_voices(segment, voices)?;
        tracing::debug!(
            session_id = %self.session_id,
            segment = segment.index,
            turns = segment.turns.len(),
            speakers = speakers.len(),
            "starting provider session"
        );

        let start = SessionStartPayload {
            session_id: self.session_id.clone(),
            speakers,
            format,
        };
        self.send_frame(Frame::json(FrameType::SessionStart, serde_json::to_vec(&start)?))
            .await?;

        let last = segment.turns.len().saturating_sub(1);
        for (i, turn) in segment.turns.iter().enumerate() {
            let payload = TurnTextPayload {
                speaker: turn.speaker,
                text: turn.text.clone(),
                is_last: i == last,
            };
            self.send_frame(Frame::json(FrameType::TurnText, serde_json::to_vec(&payload)?))
                .await?;
        }

        self.collect_audio().await
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<(), SynthError> {
        let budget = self.remaining()?.min(self.idle);
        let sent = timeout(budget, self.ws.send(WsMessage::binary(frame.encode())))
            .await
            .map_err(|_| SynthError::Timeout("total"))?;
        sent.map_err(|e| {
            tracing::warn!(session_id = %self.session_id, error = %e, "provider send failed");
            SynthError::Truncated
        })
    }

    /// Read frames until FINAL. Audio payloads are appended in arrival
    /// order, which the provider guarantees equals turn order.
    async fn collect_audio(mut self) -> Result<Vec<u8>, SynthError> {
        let mut audio: Vec<u8> = Vec::new();
        let mut chunks: u64 = 0;

        loop {
            let remaining = self.remaining()?;
            let budget = self.idle.min(remaining);
            let message = timeout(budget, self.ws.next()).await.map_err(|_| {
                if self.idle < remaining {
                    SynthError::Timeout("idle")
                } else {
                    SynthError::Timeout("total")
                }
            })?;

            match message {
                Some(Ok(WsMessage::Binary(data))) => {
                    let frame = Frame::decode(&data)?;
                    match frame.frame_type {
                        FrameType::AudioChunk => {
                            chunks += 1;
                            audio.extend_from_slice(&frame.payload);
                        }
                        FrameType::Status => {
                            let status: StatusPayload = serde_json::from_slice(&frame.payload)
                                .map_err(|e| {
                                    SynthError::Protocol(format!("bad status payload: {e}"))
                                })?;
                            if status.code == STATUS_FINAL {
                                tracing::debug!(
                                    session_id = %self.session_id,
                                    chunks,
                                    bytes = audio.len(),
                                    "provider session finished"
                                );
                                let _ = self.ws.close(None).await;
                                return Ok(audio);
                            }
                            return Err(SynthError::Provider {
                                code: status.code,
                                message: status.message,
                            });
                        }
                        other => {
                            return Err(SynthError::Protocol(format!(
                                "unexpected {other:?} frame from provider"
                            )));
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => return Err(SynthError::Truncated),
                Some(Ok(_)) => {
                    // Ping/pong handled by tungstenite; text frames are not
                    // part of the protocol and are skipped.
                }
                Some(Err(e)) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        error = %e,
                        "provider stream error"
                    );
                    return Err(SynthError::Truncated);
                }
            }
        }
    }

    fn remaining(&self) -> Result<Duration, SynthError> {
        self.deadline
            .checked_duration_since(Instant::now())
            .ok_or(SynthError::Timeout("total"))
    }
}

/// Voice assignments for the distinct speakers of a segment, in first-use
/// order. Fails if any speaker lacks a voice mapping.
fn segment_voices(segment: &Segment, voices: &VoiceMap) -> Result<Vec<SpeakerVoice>, SynthError> {
    let mut seen: Vec<u8> = Vec::new();
    let mut out = Vec::new();
    for turn in &segment.turns {
        if seen.contains(&turn.speaker) {
            continue;
        }
        seen.push(turn.speaker);
        out.push(SpeakerVoice {
            speaker: turn.speaker,
            voice: voices.voice(turn.speaker)?.to_string(),
        });
    }
    Ok(out)
}

/// hex(HMAC-SHA256(access_token, app_id || nonce)).
fn sign_nonce(app_id: &str, access_token: &str, nonce: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(access_token.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(app_id.as_bytes());
    mac.update(nonce.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

// ── Real synthesizer ───────────────────────────────────────────────

/// `SpeechSynthesizer` backed by the real provider. One fresh session per
/// call; never reused across attempts.
pub struct ProviderClient {
    config: ProviderConfig,
    voices: Arc<VoiceMap>,
}

impl ProviderClient {
    pub fn new(config: ProviderConfig, voices: Arc<VoiceMap>) -> Self {
        Self { config, voices }
    }
}

#[async_trait]
impl SpeechSynthesizer for ProviderClient {
    async fn synthesize(&self, segment: &Segment) -> Result<Vec<u8>, SynthError> {
        let session_id = format!("seg-{}-{}", segment.index, Uuid::new_v4().simple());
        let format = AudioFormat {
            codec: self.config.format.clone(),
            sample_rate: self.config.sample_rate,
        };
        let session = ProviderSession::connect(&self.config, session_id).await?;
        session.run(segment, &self.voices, format).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialogue::Turn;
    use std::collections::BTreeMap;

    fn voices() -> VoiceMap {
        VoiceMap::from_config(&BTreeMap::from([
            ("A".to_string(), "voice_a".to_string()),
            ("B".to_string(), "voice_b".to_string()),
        ]))
    }

    #[test]
    fn signature_is_deterministic_and_hex() {
        let a = sign_nonce("app", "token", "nonce-1");
        let b = sign_nonce("app", "token", "nonce-1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        // A different nonce must change the signature.
        assert_ne!(a, sign_nonce("app", "token", "nonce-2"));
    }

    #[test]
    fn segment_voices_deduplicates_in_first_use_order() {
        let segment = Segment {
            index: 0,
            turns: vec![
                Turn { speaker: 1, text: "b first".into() },
                Turn { speaker: 0, text: "then a".into() },
                Turn { speaker: 1, text: "b again".into() },
            ],
        };
        let assigned = segment_voices(&segment, &voices()).unwrap();
        assert_eq!(assigned.len(), 2);
        assert_eq!(assigned[0].speaker, 1);
        assert_eq!(assigned[0].voice, "voice_b");
        assert_eq!(assigned[1].speaker, 0);
    }

    #[test]
    fn segment_voices_rejects_unmapped_speaker() {
        let segment = Segment {
            index: 0,
            turns: vec![Turn { speaker: 9, text: "ghost".into() }],
        };
        assert!(matches!(
            segment_voices(&segment, &voices()),
            Err(SynthError::InvalidSpeaker(_))
        ));
    }
}
