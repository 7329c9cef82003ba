//! In-memory monitor backend.
//!
//! Reserved for single-process deployments and tests. One mutex guards all
//! state (tasks, idempotency claims, duration samples); no other lock is
//! ever taken while it is held. Events are published while the mutex is
//! held so subscribers observe transitions for one task in commit order.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{
    now_ms, percentile, MonitorStats, StartOutcome, Strategy, TaskEvent, TaskMonitor, TaskRecord,
    TaskStatus,
};
use crate::config::Config;
use crate::error::{ErrorKind, SynthError};

/// Bounded sample of task durations for the percentile stats.
const DURATION_SAMPLE_CAP: usize = 1000;

const EVENT_CHANNEL_CAP: usize = 256;

struct ContentClaim {
    text_id: String,
    expires_ms: i64,
}

#[derive(Default)]
struct State {
    tasks: HashMap<String, TaskRecord>,
    content: HashMap<String, ContentClaim>,
    durations: VecDeque<u64>,
    completed_total: u64,
    failed_total: u64,
    timeout_total: u64,
}

pub struct MemoryMonitor {
    state: Mutex<State>,
    events: broadcast::Sender<TaskEvent>,
    idempotency_ttl: Duration,
    terminal_retention: Duration,
}

impl MemoryMonitor {
    pub fn new(config: &Config) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAP);
        Self {
            state: Mutex::new(State::default()),
            events,
            idempotency_ttl: Duration::from_secs(config.engine.idempotency_ttl_seconds),
            terminal_retention: Duration::from_secs(config.engine.terminal_retention_seconds),
        }
    }

    /// Drop expired idempotency claims and terminal tasks past retention.
    /// Counters and duration samples survive eviction.
    fn evict_expired(&self, state: &mut State, now: i64) {
        let retention_ms = self.terminal_retention.as_millis() as i64;
        state.tasks.retain(|_, task| {
            if !task.status.is_terminal() {
                return true;
            }
            task.end_ms.map_or(true, |end| end + retention_ms > now)
        });
        state.content.retain(|_, claim| claim.expires_ms > now);
    }

    /// Apply a terminal transition. Returns the resulting status without
    /// mutating anything when the task is already terminal.
    fn terminal_transition(
        &self,
        text_id: &str,
        apply: impl FnOnce(&mut TaskRecord),
    ) -> Result<TaskStatus, SynthError> {
        let now = now_ms();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.evict_expired(state, now);

        let task = state
            .tasks
            .get_mut(text_id)
            .ok_or_else(|| SynthError::Internal(format!("unknown task {text_id}")))?;
        if task.status.is_terminal() {
            return Ok(task.status);
        }

        task.end_ms = Some(now);
        apply(task);
        let status = task.status;
        let start_ms = task.start_ms;
        let event = terminal_event(task, now);

        if let Some(start) = start_ms {
            let elapsed = (now - start).max(0) as u64;
            state.durations.push_back(elapsed);
            while state.durations.len() > DURATION_SAMPLE_CAP {
                state.durations.pop_front();
            }
        }
        match status {
            TaskStatus::Completed => state.completed_total += 1,
            TaskStatus::Failed => state.failed_total += 1,
            TaskStatus::Timeout => state.timeout_total += 1,
            TaskStatus::Queued | TaskStatus::Processing => {}
        }

        let _ = self.events.send(event);
        Ok(status)
    }
}

fn terminal_event(task: &TaskRecord, now: i64) -> TaskEvent {
    match task.status {
        TaskStatus::Completed => TaskEvent::Completed {
            text_id: task.text_id.clone(),
            status: task.status,
            audio_key: task.audio_key.clone().unwrap_or_default(),
            audio_filename: task.audio_filename.clone().unwrap_or_default(),
            ts_ms: now,
        },
        _ => TaskEvent::Failed {
            text_id: task.text_id.clone(),
            status: task.status,
            error_kind: task.error_kind.clone().unwrap_or_default(),
            error_message: task.error_message.clone().unwrap_or_default(),
            ts_ms: now,
        },
    }
}

#[async_trait]
impl TaskMonitor for MemoryMonitor {
    async fn start_task(
        &self,
        text_id: &str,
        content_hash: &str,
        user_id: &str,
    ) -> Result<StartOutcome, SynthError> {
        let now = now_ms();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.evict_expired(state, now);

        if let Some(existing) = state.tasks.get(text_id) {
            if !existing.status.is_terminal() {
                return Ok(StartOutcome::AlreadyRunning);
            }
        }

        if let Some(claim) = state.content.get(content_hash) {
            if claim.text_id != text_id {
                let other_live = state
                    .tasks
                    .get(&claim.text_id)
                    .is_some_and(|t| !t.status.is_terminal());
                if other_live {
                    return Ok(StartOutcome::DuplicateContent {
                        existing_text_id: claim.text_id.clone(),
                    });
                }
            }
        }

        state.tasks.insert(
            text_id.to_string(),
            TaskRecord::new(text_id, user_id, content_hash, now),
        );
        state.content.insert(
            content_hash.to_string(),
            ContentClaim {
                text_id: text_id.to_string(),
                expires_ms: now + self.idempotency_ttl.as_millis() as i64,
            },
        );

        let _ = self.events.send(TaskEvent::Status {
            text_id: text_id.to_string(),
            status: TaskStatus::Queued,
            ts_ms: now,
        });
        Ok(StartOutcome::Started)
    }

    async fn begin_processing(
        &self,
        text_id: &str,
        strategy: Strategy,
        segment_count: u32,
    ) -> Result<(), SynthError> {
        let now = now_ms();
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(text_id)
            .ok_or_else(|| SynthError::Internal(format!("unknown task {text_id}")))?;

        match task.status {
            TaskStatus::Queued => {
                task.status = TaskStatus::Processing;
                task.start_ms = Some(now);
                task.strategy = Some(strategy);
                task.segment_count = segment_count;
                let _ = self.events.send(TaskEvent::Status {
                    text_id: text_id.to_string(),
                    status: TaskStatus::Processing,
                    ts_ms: now,
                });
                Ok(())
            }
            TaskStatus::Processing => Ok(()),
            terminal => Err(SynthError::Internal(format!(
                "task {text_id} already {}",
                terminal.as_str()
            ))),
        }
    }

    async fn record_progress(
        &self,
        text_id: &str,
        segments_completed: u32,
    ) -> Result<(), SynthError> {
        let mut state = self.state.lock();
        if let Some(task) = state.tasks.get_mut(text_id) {
            if task.status == TaskStatus::Processing {
                task.segments_completed = segments_completed.min(task.segment_count);
                let _ = self.events.send(TaskEvent::Progress {
                    text_id: text_id.to_string(),
                    status: TaskStatus::Processing,
                    completed: task.segments_completed,
                    total: task.segment_count,
                    ts_ms: now_ms(),
                });
            }
        }
        Ok(())
    }

    async fn complete_task(
        &self,
        text_id: &str,
        audio_key: &str,
        audio_filename: &str,
    ) -> Result<TaskStatus, SynthError> {
        self.terminal_transition(text_id, |task| {
            task.status = TaskStatus::Completed;
            task.segments_completed = task.segment_count;
            task.audio_key = Some(audio_key.to_string());
            task.audio_filename = Some(audio_filename.to_string());
        })
    }

    async fn fail_task(
        &self,
        text_id: &str,
        kind: ErrorKind,
        message: &str,
    ) -> Result<TaskStatus, SynthError> {
        self.terminal_transition(text_id, |task| {
            task.status = TaskStatus::Failed;
            task.error_kind = Some(kind.as_str().to_string());
            task.error_message = Some(message.to_string());
        })
    }

    async fn timeout_task(&self, text_id: &str) -> Result<TaskStatus, SynthError> {
        self.terminal_transition(text_id, |task| {
            task.status = TaskStatus::Timeout;
            task.error_kind = Some("timeout".to_string());
            task.error_message = Some("task exceeded processing budget".to_string());
        })
    }

    async fn get_task(&self, text_id: &str) -> Result<Option<TaskRecord>, SynthError> {
        Ok(self.state.lock().tasks.get(text_id).cloned())
    }

    async fn get_stats(&self) -> Result<MonitorStats, SynthError> {
        let state = self.state.lock();
        let active = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Processing)
            .count() as u32;
        let queued = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .count() as u32;

        let terminal_total = state.completed_total + state.failed_total + state.timeout_total;
        let success_rate = if terminal_total > 0 {
            state.completed_total as f64 / terminal_total as f64
        } else {
            0.0
        };

        let mut sorted: Vec<u64> = state.durations.iter().copied().collect();
        sorted.sort_unstable();

        Ok(MonitorStats {
            active,
            queued,
            completed: state.completed_total,
            failed: state.failed_total,
            timeout: state.timeout_total,
            success_rate,
            p50_duration_ms: percentile(&sorted, 50.0),
            p95_duration_ms: percentile(&sorted, 95.0),
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    async fn sweep_timed_out(&self, task_timeout: Duration) -> Result<Vec<String>, SynthError> {
        let cutoff = now_ms() - task_timeout.as_millis() as i64;
        let stale: Vec<String> = {
            let state = self.state.lock();
            state
                .tasks
                .values()
                .filter(|t| {
                    t.status == TaskStatus::Processing
                        && t.start_ms.is_some_and(|start| start < cutoff)
                })
                .map(|t| t.text_id.clone())
                .collect()
        };

        let mut swept = Vec::with_capacity(stale.len());
        for text_id in stale {
            if self.timeout_task(&text_id).await? == TaskStatus::Timeout {
                swept.push(text_id);
            }
        }
        Ok(swept)
    }

    async fn acquire_sweep_lease(&self, _ttl: Duration) -> Result<bool, SynthError> {
        // Every process owns its private map, so every process sweeps.
        Ok(true)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
impl MemoryMonitor {
    /// Test hook: rewrite a task's start time to simulate long-running work.
    pub(crate) fn backdate_start(&self, text_id: &str, start_ms: i64) {
        if let Some(task) = self.state.lock().tasks.get_mut(text_id) {
            task.start_ms = Some(start_ms);
        }
    }
}
