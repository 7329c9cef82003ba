//! Authoritative task-state tracking.
//!
//! The monitor owns durable task status, per-text idempotency, and the
//! live event channel. Two backends implement the same contract: a shared
//! redis store for fleet deployments and an in-memory map for single-node
//! runs and tests. The backend is chosen once at startup by probing the
//! shared store; selection never changes at runtime.
//!
//! Transition rule: state is committed to the backing store *before* the
//! corresponding event is published, so a subscriber that re-reads state
//! after an event always observes at least the transitioned state.

pub mod memory;
pub mod redis;
pub mod sweeper;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::Config;
use crate::error::{ErrorKind, SynthError};
use crate::limiter::{ConcurrencyLimiter, LocalLimiter, RedisLimiter};

/// Task lifecycle. Transitions are monotonic:
/// QUEUED → PROCESSING → (COMPLETED | FAILED | TIMEOUT).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Timeout,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "timeout" => Self::Timeout,
            _ => Self::Queued,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}

/// How the engine splits work for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Serial,
    Parallel,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Serial => "serial",
            Self::Parallel => "parallel",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        if s == "parallel" {
            Self::Parallel
        } else {
            Self::Serial
        }
    }
}

/// One task as the monitor sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub text_id: String,
    pub user_id: String,
    pub content_hash: String,
    pub status: TaskStatus,
    pub strategy: Option<Strategy>,
    pub created_ms: i64,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
    pub audio_key: Option<String>,
    pub audio_filename: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub segment_count: u32,
    pub segments_completed: u32,
}

impl TaskRecord {
    pub fn new(text_id: &str, user_id: &str, content_hash: &str, created_ms: i64) -> Self {
        Self {
            text_id: text_id.to_string(),
            user_id: user_id.to_string(),
            content_hash: content_hash.to_string(),
            status: TaskStatus::Queued,
            strategy: None,
            created_ms,
            start_ms: None,
            end_ms: None,
            audio_key: None,
            audio_filename: None,
            error_kind: None,
            error_message: None,
            segment_count: 0,
            segments_completed: 0,
        }
    }
}

/// Result of `start_task`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A task for this `text_id` is already in a non-terminal state.
    AlreadyRunning,
    /// Identical content was submitted within the idempotency window and
    /// the earlier task is still non-terminal.
    DuplicateContent { existing_text_id: String },
}

/// Events published on every observed transition, fanned out to
/// subscribers. Delivery is at-least-once; late subscribers recover the
/// current state with a separate `get_task` read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Status {
        text_id: String,
        status: TaskStatus,
        ts_ms: i64,
    },
    Progress {
        text_id: String,
        status: TaskStatus,
        completed: u32,
        total: u32,
        ts_ms: i64,
    },
    Completed {
        text_id: String,
        status: TaskStatus,
        audio_key: String,
        audio_filename: String,
        ts_ms: i64,
    },
    Failed {
        text_id: String,
        status: TaskStatus,
        error_kind: String,
        error_message: String,
        ts_ms: i64,
    },
}

impl TaskEvent {
    pub fn text_id(&self) -> &str {
        match self {
            Self::Status { text_id, .. }
            | Self::Progress { text_id, .. }
            | Self::Completed { text_id, .. }
            | Self::Failed { text_id, .. } => text_id,
        }
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Status { status, .. }
            | Self::Progress { status, .. }
            | Self::Completed { status, .. }
            | Self::Failed { status, .. } => *status,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }
}

/// Aggregate counters served by `get_stats`. `success_rate` from an
/// in-memory backend resets with the process; the stats entry point
/// recomputes it against the relational store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorStats {
    pub active: u32,
    pub queued: u32,
    pub completed: u64,
    pub failed: u64,
    pub timeout: u64,
    pub success_rate: f64,
    pub p50_duration_ms: u64,
    pub p95_duration_ms: u64,
}

/// The monitor contract. `start_task` is atomic against concurrent calls
/// across processes; terminal transitions are idempotent and return the
/// state the task ended in.
#[async_trait]
pub trait TaskMonitor: Send + Sync {
    async fn start_task(
        &self,
        text_id: &str,
        content_hash: &str,
        user_id: &str,
    ) -> Result<StartOutcome, SynthError>;

    /// QUEUED → PROCESSING once a global slot is held, recording the
    /// chosen strategy and segment count.
    async fn begin_processing(
        &self,
        text_id: &str,
        strategy: Strategy,
        segment_count: u32,
    ) -> Result<(), SynthError>;

    async fn record_progress(
        &self,
        text_id: &str,
        segments_completed: u32,
    ) -> Result<(), SynthError>;

    async fn complete_task(
        &self,
        text_id: &str,
        audio_key: &str,
        audio_filename: &str,
    ) -> Result<TaskStatus, SynthError>;

    async fn fail_task(
        &self,
        text_id: &str,
        kind: ErrorKind,
        message: &str,
    ) -> Result<TaskStatus, SynthError>;

    async fn timeout_task(&self, text_id: &str) -> Result<TaskStatus, SynthError>;

    async fn get_task(&self, text_id: &str) -> Result<Option<TaskRecord>, SynthError>;

    async fn get_stats(&self) -> Result<MonitorStats, SynthError>;

    /// Subscribe to the event channel. Events for all tasks arrive on one
    /// channel; callers filter by `text_id`.
    fn subscribe(&self) -> broadcast::Receiver<TaskEvent>;

    /// Transition PROCESSING tasks older than `task_timeout` to TIMEOUT.
    /// Returns the ids that were swept.
    async fn sweep_timed_out(&self, task_timeout: Duration) -> Result<Vec<String>, SynthError>;

    /// Advisory election for the sweeper. Exactly one process in the fleet
    /// wins per lease period; the in-memory backend always wins because
    /// every process owns its private map.
    async fn acquire_sweep_lease(&self, ttl: Duration) -> Result<bool, SynthError>;

    fn backend_name(&self) -> &'static str;
}

/// Current wall clock as epoch milliseconds, the persisted time unit.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Nearest-rank percentile over an ascending-sorted sample.
pub(crate) fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Monitor + limiter pair selected at startup.
pub struct Backends {
    pub monitor: Arc<dyn TaskMonitor>,
    pub limiter: Arc<dyn ConcurrencyLimiter>,
    pub name: &'static str,
}

/// Probe the shared store and pick the backend pair. Probe failure is not
/// fatal: the process degrades to in-memory tracking with a warning.
pub async fn select_backend(config: &Config) -> Backends {
    let slot_ttl = Duration::from_secs(config.engine.slot_ttl_seconds);
    match probe_redis(&config.monitor.redis_url).await {
        Ok((client, conn)) => {
            tracing::info!(url = %config.monitor.redis_url, "shared store reachable, using redis backend");
            Backends {
                monitor: Arc::new(redis::RedisMonitor::new(client, conn.clone(), config)),
                limiter: Arc::new(RedisLimiter::new(
                    conn,
                    config.engine.max_concurrent_tasks,
                    slot_ttl,
                )),
                name: "redis",
            }
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "shared store unreachable, falling back to in-memory backend"
            );
            Backends {
                monitor: Arc::new(memory::MemoryMonitor::new(config)),
                limiter: Arc::new(LocalLimiter::new(config.engine.max_concurrent_tasks)),
                name: "memory",
            }
        }
    }
}

async fn probe_redis(
    url: &str,
) -> Result<(::redis::Client, ::redis::aio::MultiplexedConnection), SynthError> {
    const PROBE_BUDGET: Duration = Duration::from_secs(2);

    let client = ::redis::Client::open(url)?;
    let mut conn = tokio::time::timeout(PROBE_BUDGET, client.get_multiplexed_async_connection())
        .await
        .map_err(|_| SynthError::Internal("shared store probe timed out".into()))??;
    let pong: String = tokio::time::timeout(
        PROBE_BUDGET,
        ::redis::cmd("PING").query_async(&mut conn),
    )
    .await
    .map_err(|_| SynthError::Internal("shared store probe timed out".into()))??;
    if pong != "PONG" {
        return Err(SynthError::Internal(format!(
            "unexpected probe reply: {pong}"
        )));
    }
    Ok((client, conn))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_terminality() {
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Timeout.is_terminal());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Timeout,
        ] {
            assert_eq!(TaskStatus::from_str_lossy(status.as_str()), status);
        }
    }

    #[test]
    fn event_serialization_is_tagged() {
        let event = TaskEvent::Progress {
            text_id: "t-1".into(),
            status: TaskStatus::Processing,
            completed: 2,
            total: 5,
            ts_ms: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"progress""#));
        assert!(json.contains(r#""status":"processing""#));

        let parsed: TaskEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.text_id(), "t-1");
        assert!(!parsed.is_terminal());
    }

    #[test]
    fn terminal_events_report_terminal() {
        let event = TaskEvent::Failed {
            text_id: "t-2".into(),
            status: TaskStatus::Timeout,
            error_kind: "timeout".into(),
            error_message: "budget exceeded".into(),
            ts_ms: 0,
        };
        assert!(event.is_terminal());
        assert_eq!(event.status(), TaskStatus::Timeout);
    }

    #[test]
    fn percentile_nearest_rank() {
        let sample: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&sample, 50.0), 50);
        assert_eq!(percentile(&sample, 95.0), 95);
        assert_eq!(percentile(&[42], 95.0), 42);
        assert_eq!(percentile(&[], 50.0), 0);
    }
}
