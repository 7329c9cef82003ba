//! Streaming TTS provider integration.
//!
//! `frame` defines the binary wire codec, `session` drives one
//! bidirectional WebSocket session per segment. The `SpeechSynthesizer`
//! trait is the seam between orchestration and the wire: the engine and
//! workers only ever see `segment in, bytes out`, which keeps them fully
//! testable against scripted fakes.

pub mod frame;
pub mod session;

use crate::dialogue::Segment;
use crate::error::SynthError;
use async_trait::async_trait;

/// Synthesizes one segment into a contiguous audio byte buffer.
///
/// Implementations must return bytes in dispatched-turn order and must not
/// retain state across calls: the worker creates a fresh provider session
/// per attempt through this trait.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, segment: &Segment) -> Result<Vec<u8>, SynthError>;
}

pub use frame::{AudioFormat, SpeakerVoice};
pub use session::{ProviderClient, ProviderSession};
