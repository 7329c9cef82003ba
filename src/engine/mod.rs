//! Task orchestration.
//!
//! `TaskEngine::run_task` supervises one full synthesis job: global slot
//! acquisition (with TTL renewal while the task runs), the
//! QUEUED → PROCESSING transition, serial or batched-parallel segment
//! execution, in-order byte concatenation, artifact upload, the audio row
//! insert, and the terminal monitor transition. The slot is released
//! exactly once on every exit path, and no partial artifact is ever
//! persisted: a failing segment cancels its batch peers and discards all
//! buffers.

pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, EngineConfig};
use crate::dialogue::{self, Segment, VoiceMap};
use crate::error::{ErrorKind, SynthError};
use crate::limiter::ConcurrencyLimiter;
use crate::monitor::{Strategy, TaskMonitor};
use crate::provider::SpeechSynthesizer;
use crate::storage::blob::{audio_filename, audio_object_key};
use crate::storage::db::AudioRow;
use crate::storage::{ObjectStore, TaskIndex};
use worker::SegmentWorker;

/// Held-slot TTLs are refreshed on this cadence while a task runs.
const SLOT_RENEW_INTERVAL: Duration = Duration::from_secs(60);

/// What a successful execution produced.
#[derive(Debug, Clone)]
pub struct CompletedArtifact {
    pub audio_key: String,
    pub audio_filename: String,
    pub audio_url: String,
    pub size_bytes: u64,
}

pub struct TaskEngine {
    engine: EngineConfig,
    public_read: bool,
    transient_codes: Arc<Vec<i32>>,
    voices: Arc<VoiceMap>,
    monitor: Arc<dyn TaskMonitor>,
    limiter: Arc<dyn ConcurrencyLimiter>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    store: Arc<dyn ObjectStore>,
    index: Arc<TaskIndex>,
}

impl TaskEngine {
    pub fn new(
        config: &Config,
        monitor: Arc<dyn TaskMonitor>,
        limiter: Arc<dyn ConcurrencyLimiter>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        store: Arc<dyn ObjectStore>,
        index: Arc<TaskIndex>,
    ) -> Self {
        Self {
            engine: config.engine.clone(),
            public_read: config.storage.public_read,
            transient_codes: Arc::new(config.provider.transient_error_codes.clone()),
            voices: Arc::new(VoiceMap::from_config(&config.speakers)),
            monitor,
            limiter,
            synthesizer,
            store,
            index,
        }
    }

    pub fn voices(&self) -> Arc<VoiceMap> {
        Arc::clone(&self.voices)
    }

    /// Provider status codes classified as retryable, for callers that
    /// need to translate error kinds themselves.
    pub fn transient_codes(&self) -> &[i32] {
        &self.transient_codes
    }

    /// Supervised end-to-end run for an admitted task. The caller has
    /// already registered the task with the monitor (QUEUED); everything
    /// from slot acquisition to the terminal transition happens here.
    pub async fn run_task(self: Arc<Self>, text_id: String, text: String) {
        let queue_wait = Duration::from_secs(self.engine.queue_wait_timeout_seconds);
        match self.limiter.acquire(&text_id, queue_wait).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(text_id = %text_id, "no global slot within queue window");
                let _ = self
                    .monitor
                    .fail_task(
                        &text_id,
                        ErrorKind::Internal,
                        "no global capacity within queue window",
                    )
                    .await;
                return;
            }
            Err(e) => {
                tracing::error!(text_id = %text_id, error = %e, "slot acquisition failed");
                let _ = self
                    .monitor
                    .fail_task(&text_id, ErrorKind::Internal, &e.to_string())
                    .await;
                return;
            }
        }

        let renewal = self.spawn_slot_renewal(text_id.clone());
        let result = self.execute(&text_id, &text).await;
        renewal.abort();

        match result {
            Ok(artifact) => {
                tracing::info!(
                    text_id = %text_id,
                    audio_key = %artifact.audio_key,
                    size = artifact.size_bytes,
                    "task completed"
                );
                if let Err(e) = self
                    .monitor
                    .complete_task(&text_id, &artifact.audio_key, &artifact.audio_filename)
                    .await
                {
                    tracing::error!(text_id = %text_id, error = %e, "completion transition failed");
                }
            }
            Err(e) => {
                let kind = e.kind(&self.transient_codes);
                tracing::error!(
                    text_id = %text_id,
                    kind = kind.as_str(),
                    error = %e,
                    "task failed"
                );
                if let Err(e2) = self.monitor.fail_task(&text_id, kind, &e.to_string()).await {
                    tracing::error!(text_id = %text_id, error = %e2, "failure transition failed");
                }
            }
        }

        if let Err(e) = self.limiter.release(&text_id).await {
            tracing::warn!(text_id = %text_id, error = %e, "slot release failed");
        }
    }

    fn spawn_slot_renewal(&self, text_id: String) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(&self.limiter);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SLOT_RENEW_INTERVAL);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                if let Err(e) = limiter.renew(&text_id).await {
                    tracing::warn!(text_id = %text_id, error = %e, "slot renewal failed");
                }
            }
        })
    }

    /// Core algorithm. Preconditions: a global slot is held and the task
    /// is registered with the monitor.
    pub async fn execute(&self, text_id: &str, text: &str) -> Result<CompletedArtifact, SynthError> {
        let char_count = text.chars().count();
        if char_count > self.engine.max_text_chars {
            return Err(SynthError::OversizedText {
                chars: char_count,
                limit: self.engine.max_text_chars,
            });
        }

        let turns = dialogue::parse(text, &self.voices)?;
        let segments = dialogue::segment(turns, self.engine.max_turns_per_segment);
        let strategy = choose_strategy(char_count, segments.len(), self.engine.long_text_threshold);

        self.monitor
            .begin_processing(text_id, strategy, segments.len() as u32)
            .await?;
        tracing::info!(
            text_id = %text_id,
            strategy = strategy.as_str(),
            segments = segments.len(),
            chars = char_count,
            "task processing"
        );

        let buffers = match strategy {
            Strategy::Serial => self.run_serial(text_id, &segments).await?,
            Strategy::Parallel => self.run_parallel(text_id, segments).await?,
        };

        // The codec is append-safe, so the artifact is the plain in-order
        // concatenation of per-segment buffers.
        let mut audio = Vec::with_capacity(buffers.iter().map(Vec::len).sum());
        for buffer in &buffers {
            audio.extend_from_slice(buffer);
        }
        let size_bytes = audio.len() as u64;

        // The sweeper may have timed this task out while segments were in
        // flight; a task that is no longer PROCESSING must not publish an
        // artifact.
        let task = self.monitor.get_task(text_id).await?;
        let user_id = match task {
            Some(t) if t.status == crate::monitor::TaskStatus::Processing => t.user_id,
            _ => return Err(SynthError::Cancelled),
        };

        let version = self.index.next_audio_version(text_id)?;
        let audio_key = audio_object_key(text_id, char_count, version, Utc::now());
        let filename = audio_filename(text_id, version);
        let audio_url = self
            .store
            .put(&audio_key, audio, "audio/mpeg", self.public_read)
            .await?;

        self.index.insert_audio(&AudioRow {
            audio_id: 0,
            text_id: text_id.to_string(),
            user_id,
            filename: filename.clone(),
            object_key: audio_key.clone(),
            duration_secs: None,
            size_bytes,
            version_num: version,
        })?;

        Ok(CompletedArtifact {
            audio_key,
            audio_filename: filename,
            audio_url,
            size_bytes,
        })
    }

    fn worker(&self) -> SegmentWorker {
        SegmentWorker::new(
            Arc::clone(&self.synthesizer),
            self.engine.segment_max_retries,
            Duration::from_secs(self.engine.segment_retry_delay_base_secs),
            Arc::clone(&self.transient_codes),
        )
    }

    async fn run_serial(
        &self,
        text_id: &str,
        segments: &[Segment],
    ) -> Result<Vec<Vec<u8>>, SynthError> {
        let worker = self.worker();
        let mut buffers = Vec::with_capacity(segments.len());
        for segment in segments {
            let bytes = worker.run(segment.clone(), CancellationToken::new()).await?;
            buffers.push(bytes);
            let _ = self
                .monitor
                .record_progress(text_id, buffers.len() as u32)
                .await;
        }
        Ok(buffers)
    }

    /// Contiguous batches of `max_concurrent_segments` workers. The batch
    /// is a barrier: all members finish (or are cancelled) before the next
    /// batch starts. The first failure wins, cancels its peers, and fails
    /// the task.
    async fn run_parallel(
        &self,
        text_id: &str,
        segments: Vec<Segment>,
    ) -> Result<Vec<Vec<u8>>, SynthError> {
        let worker = Arc::new(self.worker());
        let mut slots: Vec<Option<Vec<u8>>> = vec![None; segments.len()];
        let mut completed = 0u32;

        for batch in segments.chunks(self.engine.max_concurrent_segments.max(1)) {
            let cancel = CancellationToken::new();
            let mut join: JoinSet<(usize, Result<Vec<u8>, SynthError>)> = JoinSet::new();
            for segment in batch {
                let worker = Arc::clone(&worker);
                let segment = segment.clone();
                let token = cancel.child_token();
                join.spawn(async move {
                    let index = segment.index;
                    (index, worker.run(segment, token).await)
                });
            }

            let mut batch_err: Option<SynthError> = None;
            while let Some(joined) = join.join_next().await {
                match joined {
                    Ok((index, Ok(bytes))) => {
                        if batch_err.is_none() {
                            slots[index] = Some(bytes);
                            completed += 1;
                            let _ = self.monitor.record_progress(text_id, completed).await;
                        }
                    }
                    Ok((index, Err(e))) => {
                        if batch_err.is_none() {
                            tracing::warn!(
                                text_id = %text_id,
                                segment = index,
                                error = %e,
                                "batch member failed, cancelling peers"
                            );
                            cancel.cancel();
                            batch_err = Some(e);
                        }
                    }
                    Err(join_err) => {
                        if batch_err.is_none() {
                            cancel.cancel();
                            batch_err =
                                Some(SynthError::Internal(format!("worker panicked: {join_err}")));
                        }
                    }
                }
            }

            if let Some(e) = batch_err {
                return Err(e);
            }
        }

        // Every slot was filled by its batch; reassembly is by index, not
        // completion order.
        Ok(slots.into_iter().map(Option::unwrap_or_default).collect())
    }
}

/// SERIAL for short texts and single-segment tasks; PARALLEL from the
/// character threshold (inclusive) up.
pub fn choose_strategy(char_count: usize, segment_count: usize, threshold: usize) -> Strategy {
    if segment_count <= 1 || char_count < threshold {
        Strategy::Serial
    } else {
        Strategy::Parallel
    }
}
