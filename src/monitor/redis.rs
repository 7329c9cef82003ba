//! Shared-store monitor backend over redis.
//!
//! Task state lives in a hash per task (`vw:task:{text_id}`), the
//! idempotency map in plain keys with TTL (`vw:content:{hash}`), and the
//! set of non-terminal tasks in `vw:active`. Every read-then-write
//! mutation is a single Lua script, and each script publishes its event in
//! the same atomic step, so the store commit always precedes the event and
//! per-task event order matches commit order. A background task bridges
//! `vw:events:*` pub/sub messages into the process-local broadcast
//! channel, giving subscribers cross-process visibility.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::Script;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{
    now_ms, percentile, MonitorStats, StartOutcome, Strategy, TaskEvent, TaskMonitor, TaskRecord,
    TaskStatus,
};
use crate::config::Config;
use crate::error::{ErrorKind, SynthError};

const ACTIVE_KEY: &str = "vw:active";
const STATS_KEY: &str = "vw:stats";
const DURATIONS_KEY: &str = "vw:durations";
const LEASE_KEY: &str = "vw:sweeper:lease";
const EVENT_PATTERN: &str = "vw:events:*";

const EVENT_CHANNEL_CAP: usize = 256;
const DURATION_SAMPLE_CAP: isize = 999;

fn task_key(text_id: &str) -> String {
    format!("vw:task:{text_id}")
}

fn content_key(hash: &str) -> String {
    format!("vw:content:{hash}")
}

fn event_channel(text_id: &str) -> String {
    format!("vw:events:{text_id}")
}

pub struct RedisMonitor {
    conn: MultiplexedConnection,
    events: broadcast::Sender<TaskEvent>,
    idempotency_ttl: Duration,
    terminal_retention: Duration,
    instance_id: String,
    start_script: Script,
    begin_script: Script,
    progress_script: Script,
    terminal_script: Script,
    lease_script: Script,
    bridge: JoinHandle<()>,
}

impl RedisMonitor {
    pub fn new(client: redis::Client, conn: MultiplexedConnection, config: &Config) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAP);
        let bridge = tokio::spawn(bridge_events(client, events.clone()));

        Self {
            conn,
            events,
            idempotency_ttl: Duration::from_secs(config.engine.idempotency_ttl_seconds),
            terminal_retention: Duration::from_secs(config.engine.terminal_retention_seconds),
            instance_id: Uuid::new_v4().to_string(),
            start_script: Script::new(START_SCRIPT),
            begin_script: Script::new(BEGIN_SCRIPT),
            progress_script: Script::new(PROGRESS_SCRIPT),
            terminal_script: Script::new(TERMINAL_SCRIPT),
            lease_script: Script::new(LEASE_SCRIPT),
            bridge,
        }
    }

    async fn run_terminal(
        &self,
        text_id: &str,
        status: TaskStatus,
        extra_fields: &[(&str, &str)],
        event: &TaskEvent,
    ) -> Result<TaskStatus, SynthError> {
        let now = now_ms();
        let mut conn = self.conn.clone();
        let mut invocation = self.terminal_script.prepare_invoke();
        invocation
            .key(task_key(text_id))
            .key(ACTIVE_KEY)
            .key(STATS_KEY)
            .key(DURATIONS_KEY)
            .arg(status.as_str())
            .arg(now)
            .arg(self.terminal_retention.as_millis() as i64)
            .arg(event_channel(text_id))
            .arg(serde_json::to_string(event)?);
        for (field, value) in extra_fields {
            invocation.arg(*field).arg(*value);
        }
        let reply: String = invocation.invoke_async(&mut conn).await?;
        match reply.as_str() {
            "missing" => Err(SynthError::Internal(format!("unknown task {text_id}"))),
            other => Ok(TaskStatus::from_str_lossy(other)),
        }
    }
}

impl Drop for RedisMonitor {
    fn drop(&mut self) {
        self.bridge.abort();
    }
}

/// Forward provider-store pub/sub events into the local broadcast channel,
/// reconnecting with a flat backoff when the subscription drops.
async fn bridge_events(client: redis::Client, events: broadcast::Sender<TaskEvent>) {
    loop {
        let pubsub = match client.get_async_pubsub().await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "event bridge connect failed, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        let mut pubsub = pubsub;
        if let Err(e) = pubsub.psubscribe(EVENT_PATTERN).await {
            tracing::warn!(error = %e, "event bridge subscribe failed, retrying");
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }

        let mut stream = pubsub.into_on_message();
        while let Some(message) = stream.next().await {
            let payload: String = match message.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    tracing::debug!(error = %e, "ignoring undecodable event payload");
                    continue;
                }
            };
            match serde_json::from_str::<TaskEvent>(&payload) {
                Ok(event) => {
                    let _ = events.send(event);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "ignoring malformed event payload");
                }
            }
        }
        tracing::warn!("event bridge stream ended, reconnecting");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[async_trait]
impl TaskMonitor for RedisMonitor {
    async fn start_task(
        &self,
        text_id: &str,
        content_hash: &str,
        user_id: &str,
    ) -> Result<StartOutcome, SynthError> {
        let now = now_ms();
        let event = TaskEvent::Status {
            text_id: text_id.to_string(),
            status: TaskStatus::Queued,
            ts_ms: now,
        };
        let mut conn = self.conn.clone();
        let reply: String = self
            .start_script
            .key(task_key(text_id))
            .key(content_key(content_hash))
            .key(ACTIVE_KEY)
            .arg(text_id)
            .arg(content_hash)
            .arg(user_id)
            .arg(now)
            .arg(self.idempotency_ttl.as_secs())
            .arg(event_channel(text_id))
            .arg(serde_json::to_string(&event)?)
            .invoke_async(&mut conn)
            .await?;

        Ok(parse_start_reply(&reply))
    }

    async fn begin_processing(
        &self,
        text_id: &str,
        strategy: Strategy,
        segment_count: u32,
    ) -> Result<(), SynthError> {
        let now = now_ms();
        let event = TaskEvent::Status {
            text_id: text_id.to_string(),
            status: TaskStatus::Processing,
            ts_ms: now,
        };
        let mut conn = self.conn.clone();
        let reply: String = self
            .begin_script
            .key(task_key(text_id))
            .arg(now)
            .arg(strategy.as_str())
            .arg(segment_count)
            .arg(event_channel(text_id))
            .arg(serde_json::to_string(&event)?)
            .invoke_async(&mut conn)
            .await?;

        match reply.as_str() {
            "processing" => Ok(()),
            "missing" => Err(SynthError::Internal(format!("unknown task {text_id}"))),
            terminal => Err(SynthError::Internal(format!(
                "task {text_id} already {terminal}"
            ))),
        }
    }

    async fn record_progress(
        &self,
        text_id: &str,
        segments_completed: u32,
    ) -> Result<(), SynthError> {
        let mut conn = self.conn.clone();
        let total: Option<u32> = redis::cmd("HGET")
            .arg(task_key(text_id))
            .arg("segment_count")
            .query_async(&mut conn)
            .await?;
        let total = total.unwrap_or(0);
        let completed = segments_completed.min(total);

        let event = TaskEvent::Progress {
            text_id: text_id.to_string(),
            status: TaskStatus::Processing,
            completed,
            total,
            ts_ms: now_ms(),
        };
        let _: i32 = self
            .progress_script
            .key(task_key(text_id))
            .arg(completed)
            .arg(event_channel(text_id))
            .arg(serde_json::to_string(&event)?)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn complete_task(
        &self,
        text_id: &str,
        audio_key: &str,
        audio_filename: &str,
    ) -> Result<TaskStatus, SynthError> {
        let event = TaskEvent::Completed {
            text_id: text_id.to_string(),
            status: TaskStatus::Completed,
            audio_key: audio_key.to_string(),
            audio_filename: audio_filename.to_string(),
            ts_ms: now_ms(),
        };
        self.run_terminal(
            text_id,
            TaskStatus::Completed,
            &[("audio_key", audio_key), ("audio_filename", audio_filename)],
            &event,
        )
        .await
    }

    async fn fail_task(
        &self,
        text_id: &str,
        kind: ErrorKind,
        message: &str,
    ) -> Result<TaskStatus, SynthError> {
        let event = TaskEvent::Failed {
            text_id: text_id.to_string(),
            status: TaskStatus::Failed,
            error_kind: kind.as_str().to_string(),
            error_message: message.to_string(),
            ts_ms: now_ms(),
        };
        self.run_terminal(
            text_id,
            TaskStatus::Failed,
            &[("error_kind", kind.as_str()), ("error_message", message)],
            &event,
        )
        .await
    }

    async fn timeout_task(&self, text_id: &str) -> Result<TaskStatus, SynthError> {
        let message = "task exceeded processing budget";
        let event = TaskEvent::Failed {
            text_id: text_id.to_string(),
            status: TaskStatus::Timeout,
            error_kind: "timeout".to_string(),
            error_message: message.to_string(),
            ts_ms: now_ms(),
        };
        self.run_terminal(
            text_id,
            TaskStatus::Timeout,
            &[("error_kind", "timeout"), ("error_message", message)],
            &event,
        )
        .await
    }

    async fn get_task(&self, text_id: &str) -> Result<Option<TaskRecord>, SynthError> {
        let mut conn = self.conn.clone();
        let hash: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(task_key(text_id))
            .query_async(&mut conn)
            .await?;
        if hash.is_empty() {
            return Ok(None);
        }
        Ok(Some(record_from_hash(&hash)))
    }

    async fn get_stats(&self) -> Result<MonitorStats, SynthError> {
        let mut conn = self.conn.clone();
        let active_ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(ACTIVE_KEY)
            .query_async(&mut conn)
            .await?;

        let mut active = 0u32;
        let mut queued = 0u32;
        for text_id in &active_ids {
            let status: Option<String> = redis::cmd("HGET")
                .arg(task_key(text_id))
                .arg("status")
                .query_async(&mut conn)
                .await?;
            match status.as_deref() {
                Some("processing") => active += 1,
                Some("queued") => queued += 1,
                // Stale member (task hash expired); ignore.
                _ => {}
            }
        }

        let counters: HashMap<String, u64> = redis::cmd("HGETALL")
            .arg(STATS_KEY)
            .query_async(&mut conn)
            .await?;
        let completed = counters.get("completed").copied().unwrap_or(0);
        let failed = counters.get("failed").copied().unwrap_or(0);
        let timeout = counters.get("timeout").copied().unwrap_or(0);
        let terminal_total = completed + failed + timeout;
        let success_rate = if terminal_total > 0 {
            completed as f64 / terminal_total as f64
        } else {
            0.0
        };

        let raw_durations: Vec<u64> = redis::cmd("LRANGE")
            .arg(DURATIONS_KEY)
            .arg(0)
            .arg(DURATION_SAMPLE_CAP)
            .query_async(&mut conn)
            .await?;
        let mut sorted = raw_durations;
        sorted.sort_unstable();

        Ok(MonitorStats {
            active,
            queued,
            completed,
            failed,
            timeout,
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
        let mut conn = self.conn.clone();
        let active_ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(ACTIVE_KEY)
            .query_async(&mut conn)
            .await?;

        let mut swept = Vec::new();
        for text_id in active_ids {
            let fields: Vec<Option<String>> = redis::cmd("HMGET")
                .arg(task_key(&text_id))
                .arg("status")
                .arg("start_ms")
                .query_async(&mut conn)
                .await?;
            let status = fields.first().cloned().flatten();
            let start_ms = fields
                .get(1)
                .cloned()
                .flatten()
                .and_then(|s| s.parse::<i64>().ok());
            let stale = status.as_deref() == Some("processing")
                && start_ms.is_some_and(|start| start < cutoff);
            if stale && self.timeout_task(&text_id).await? == TaskStatus::Timeout {
                swept.push(text_id);
            }
        }
        Ok(swept)
    }

    async fn acquire_sweep_lease(&self, ttl: Duration) -> Result<bool, SynthError> {
        let mut conn = self.conn.clone();
        let won: i32 = self
            .lease_script
            .key(LEASE_KEY)
            .arg(&self.instance_id)
            .arg(ttl.as_millis() as i64)
            .invoke_async(&mut conn)
            .await?;
        Ok(won == 1)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

// ── Scripts ────────────────────────────────────────────────────────

/// Atomic check-and-set for task admission: rejects a live duplicate
/// `text_id`, rejects identical content while its task is non-terminal,
/// then writes the fresh record, the idempotency claim, and the queued
/// event in one step.
const START_SCRIPT: &str = r"
local status = redis.call('HGET', KEYS[1], 'status')
if status and status ~= 'completed' and status ~= 'failed' and status ~= 'timeout' then
  return 'running'
end
local owner = redis.call('GET', KEYS[2])
if owner and owner ~= ARGV[1] then
  local other = redis.call('HGET', 'vw:task:' .. owner, 'status')
  if other and other ~= 'completed' and other ~= 'failed' and other ~= 'timeout' then
    return 'dup:' .. owner
  end
end
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1],
  'text_id', ARGV[1], 'user_id', ARGV[3], 'content_hash', ARGV[2],
  'status', 'queued', 'created_ms', ARGV[4],
  'segment_count', '0', 'segments_completed', '0')
redis.call('SET', KEYS[2], ARGV[1], 'EX', ARGV[5])
redis.call('SADD', KEYS[3], ARGV[1])
redis.call('PUBLISH', ARGV[6], ARGV[7])
return 'started'
";

const BEGIN_SCRIPT: &str = r"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then return 'missing' end
if status == 'queued' then
  redis.call('HSET', KEYS[1], 'status', 'processing',
    'start_ms', ARGV[1], 'strategy', ARGV[2], 'segment_count', ARGV[3])
  redis.call('PUBLISH', ARGV[4], ARGV[5])
  return 'processing'
end
return status
";

const PROGRESS_SCRIPT: &str = r"
local status = redis.call('HGET', KEYS[1], 'status')
if status == 'processing' then
  redis.call('HSET', KEYS[1], 'segments_completed', ARGV[1])
  redis.call('PUBLISH', ARGV[2], ARGV[3])
end
return 1
";

/// Terminal transitions are idempotent: a task already terminal is left
/// untouched and its current status returned. Extra hash fields arrive as
/// trailing ARGV pairs.
const TERMINAL_SCRIPT: &str = r"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then return 'missing' end
if status == 'completed' or status == 'failed' or status == 'timeout' then
  return status
end
redis.call('HSET', KEYS[1], 'status', ARGV[1], 'end_ms', ARGV[2])
for i = 6, #ARGV, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
if ARGV[1] == 'completed' then
  local total = redis.call('HGET', KEYS[1], 'segment_count')
  if total then
    redis.call('HSET', KEYS[1], 'segments_completed', total)
  end
end
local text_id = redis.call('HGET', KEYS[1], 'text_id')
if text_id then
  redis.call('SREM', KEYS[2], text_id)
end
redis.call('HINCRBY', KEYS[3], ARGV[1], 1)
local start = redis.call('HGET', KEYS[1], 'start_ms')
if start then
  local elapsed = tonumber(ARGV[2]) - tonumber(start)
  if elapsed and elapsed >= 0 then
    redis.call('LPUSH', KEYS[4], tostring(elapsed))
    redis.call('LTRIM', KEYS[4], 0, 999)
  end
end
redis.call('PEXPIRE', KEYS[1], ARGV[3])
redis.call('PUBLISH', ARGV[4], ARGV[5])
return ARGV[1]
";

/// Advisory sweeper election: first writer wins the lease, the holder may
/// refresh it, everyone else loses until it expires.
const LEASE_SCRIPT: &str = r"
local holder = redis.call('GET', KEYS[1])
if not holder then
  redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
  return 1
end
if holder == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return 1
end
return 0
";

// ── Hash mapping ───────────────────────────────────────────────────

fn parse_start_reply(reply: &str) -> StartOutcome {
    match reply {
        "started" => StartOutcome::Started,
        "running" => StartOutcome::AlreadyRunning,
        other => match other.strip_prefix("dup:") {
            Some(existing) => StartOutcome::DuplicateContent {
                existing_text_id: existing.to_string(),
            },
            None => StartOutcome::AlreadyRunning,
        },
    }
}

fn record_from_hash(hash: &HashMap<String, String>) -> TaskRecord {
    let get = |field: &str| hash.get(field).cloned();
    let get_i64 = |field: &str| hash.get(field).and_then(|v| v.parse::<i64>().ok());
    let get_u32 = |field: &str| {
        hash.get(field)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0)
    };

    TaskRecord {
        text_id: get("text_id").unwrap_or_default(),
        user_id: get("user_id").unwrap_or_default(),
        content_hash: get("content_hash").unwrap_or_default(),
        status: TaskStatus::from_str_lossy(get("status").unwrap_or_default().as_str()),
        strategy: get("strategy").map(|s| Strategy::from_str_lossy(&s)),
        created_ms: get_i64("created_ms").unwrap_or(0),
        start_ms: get_i64("start_ms"),
        end_ms: get_i64("end_ms"),
        audio_key: get("audio_key"),
        audio_filename: get("audio_filename"),
        error_kind: get("error_kind"),
        error_message: get("error_message"),
        segment_count: get_u32("segment_count"),
        segments_completed: get_u32("segments_completed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_reply_parsing() {
        assert_eq!(parse_start_reply("started"), StartOutcome::Started);
        assert_eq!(parse_start_reply("running"), StartOutcome::AlreadyRunning);
        assert_eq!(
            parse_start_reply("dup:text-42"),
            StartOutcome::DuplicateContent {
                existing_text_id: "text-42".into()
            }
        );
    }

    #[test]
    fn key_layout() {
        assert_eq!(task_key("t-1"), "vw:task:t-1");
        assert_eq!(content_key("abcd"), "vw:content:abcd");
        assert_eq!(event_channel("t-1"), "vw:events:t-1");
    }

    #[test]
    fn record_from_hash_parses_all_fields() {
        let hash: HashMap<String, String> = [
            ("text_id", "t-9"),
            ("user_id", "u-1"),
            ("content_hash", "beef"),
            ("status", "processing"),
            ("strategy", "parallel"),
            ("created_ms", "1000"),
            ("start_ms", "2000"),
            ("segment_count", "3"),
            ("segments_completed", "1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let record = record_from_hash(&hash);
        assert_eq!(record.text_id, "t-9");
        assert_eq!(record.status, TaskStatus::Processing);
        assert_eq!(record.strategy, Some(Strategy::Parallel));
        assert_eq!(record.start_ms, Some(2000));
        assert_eq!(record.end_ms, None);
        assert_eq!(record.segment_count, 3);
        assert_eq!(record.segments_completed, 1);
    }

    #[test]
    fn record_from_hash_tolerates_missing_fields() {
        let hash: HashMap<String, String> =
            [("text_id".to_string(), "t-1".to_string())].into_iter().collect();
        let record = record_from_hash(&hash);
        assert_eq!(record.status, TaskStatus::Queued);
        assert!(record.strategy.is_none());
        assert_eq!(record.segment_count, 0);
    }
}
