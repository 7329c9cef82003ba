//! Segment execution with bounded retries.
//!
//! Each attempt drives a fresh provider session through the
//! `SpeechSynthesizer` seam; sessions are never reused across attempts.
//! Only transient errors are retried, with linear backoff
//! (`base * attempt_index`) matching the provider's observed recovery
//! behavior. A cancellation signal from the batch aborts both the backoff
//! wait and the in-flight session.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::dialogue::Segment;
use crate::error::SynthError;
use crate::provider::SpeechSynthesizer;

pub struct SegmentWorker {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    max_retries: u32,
    backoff_base: Duration,
    transient_codes: Arc<Vec<i32>>,
}

impl SegmentWorker {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        max_retries: u32,
        backoff_base: Duration,
        transient_codes: Arc<Vec<i32>>,
    ) -> Self {
        Self {
            synthesizer,
            max_retries,
            backoff_base,
            transient_codes,
        }
    }

    /// Synthesize one segment, retrying transient failures. On exhaustion
    /// the last error is surfaced; the caller still knows the segment via
    /// its index.
    pub async fn run(
        &self,
        segment: Segment,
        cancel: CancellationToken,
    ) -> Result<Vec<u8>, SynthError> {
        let attempts = self.max_retries.max(1);
        let mut last_err = SynthError::Internal("segment never attempted".into());

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = self.backoff_base * (attempt - 1);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SynthError::Cancelled),
                    _ = sleep(delay) => {}
                }
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(SynthError::Cancelled),
                result = self.synthesizer.synthesize(&segment) => result,
            };

            match result {
                Ok(bytes) => {
                    if attempt > 1 {
                        tracing::info!(
                            segment = segment.index,
                            attempt,
                            "segment recovered after retry"
                        );
                    }
                    return Ok(bytes);
                }
                Err(e) if e.is_transient(&self.transient_codes) && attempt < attempts => {
                    tracing::warn!(
                        segment = segment.index,
                        attempt,
                        error = %e,
                        "transient segment failure, will retry"
                    );
                    last_err = e;
                }
                Err(e) => {
                    tracing::error!(
                        segment = segment.index,
                        attempt,
                        error = %e,
                        "segment failed"
                    );
                    return Err(e);
                }
            }
        }

        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    const CODES: &[i32] = &[45000001];

    /// Scripted attempt outcomes for one worker run.
    enum Outcome {
        Ok(Vec<u8>),
        Transient,
        Fatal,
        Timeout,
    }

    struct ScriptedSynth {
        script: Mutex<VecDeque<Outcome>>,
        calls: AtomicU32,
    }

    impl ScriptedSynth {
        fn new(script: Vec<Outcome>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for ScriptedSynth {
        async fn synthesize(&self, _segment: &Segment) -> Result<Vec<u8>, SynthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().pop_front() {
                Some(Outcome::Ok(bytes)) => Ok(bytes),
                Some(Outcome::Transient) => Err(SynthError::Provider {
                    code: 45000001,
                    message: "server busy".into(),
                }),
                Some(Outcome::Fatal) => Err(SynthError::Provider {
                    code: 55000000,
                    message: "bad voice".into(),
                }),
                Some(Outcome::Timeout) => Err(SynthError::Timeout("idle")),
                None => Err(SynthError::Internal("script exhausted".into())),
            }
        }
    }

    fn worker(synth: Arc<ScriptedSynth>, retries: u32) -> SegmentWorker {
        SegmentWorker::new(
            synth,
            retries,
            Duration::from_millis(1),
            Arc::new(CODES.to_vec()),
        )
    }

    fn segment() -> Segment {
        Segment {
            index: 4,
            turns: vec![crate::dialogue::Turn {
                speaker: 0,
                text: "hello".into(),
            }],
        }
    }

    #[tokio::test]
    async fn succeeds_first_try() {
        let synth = ScriptedSynth::new(vec![Outcome::Ok(vec![1, 2, 3])]);
        let bytes = worker(synth.clone(), 3)
            .run(segment(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(synth.calls(), 1);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let synth = ScriptedSynth::new(vec![
            Outcome::Timeout,
            Outcome::Transient,
            Outcome::Ok(vec![9]),
        ]);
        let bytes = worker(synth.clone(), 3)
            .run(segment(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(bytes, vec![9]);
        assert_eq!(synth.calls(), 3);
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let synth = ScriptedSynth::new(vec![Outcome::Fatal, Outcome::Ok(vec![1])]);
        let err = worker(synth.clone(), 3)
            .run(segment(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SynthError::Provider { code: 55000000, .. }));
        assert_eq!(synth.calls(), 1);
    }

    #[tokio::test]
    async fn exhaustion_preserves_last_error() {
        let synth = ScriptedSynth::new(vec![
            Outcome::Transient,
            Outcome::Transient,
            Outcome::Timeout,
        ]);
        let err = worker(synth.clone(), 3)
            .run(segment(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SynthError::Timeout("idle")));
        assert_eq!(synth.calls(), 3);
    }

    #[tokio::test]
    async fn cancellation_preempts_retry_wait() {
        let synth = ScriptedSynth::new(vec![Outcome::Transient, Outcome::Ok(vec![1])]);
        let worker = SegmentWorker::new(
            synth.clone(),
            3,
            // A backoff long enough that the test would hang without
            // cancellation taking effect.
            Duration::from_secs(30),
            Arc::new(CODES.to_vec()),
        );
        let cancel = CancellationToken::new();
        let run = {
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.run(segment(), cancel).await })
        };
        // Let the first attempt fail, then cancel during its backoff wait.
        sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, SynthError::Cancelled));
        assert_eq!(synth.calls(), 1);
    }
}
