//! voxweave — dialogue-to-audio synthesis orchestration.
//!
//! Accepts long dialogue-style texts and produces one concatenated audio
//! artifact by driving a remote streaming TTS provider:
//!
//! - `dialogue` — speaker-tagged parsing and bounded segmentation
//! - `provider` — binary frame codec and the per-segment WebSocket session
//! - `engine` — serial/parallel orchestration, retries, upload, recording
//! - `limiter` — fleet-wide concurrency ceiling (redis or local semaphore)
//! - `monitor` — task lifecycle, idempotency, event pub/sub, sweeper
//! - `storage` — blob store and the texts/audios relational index
//! - `gateway` — HTTP surface: submit, retry, task reads, SSE, stats

pub mod config;
pub mod dialogue;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod limiter;
pub mod monitor;
pub mod provider;
pub mod storage;
