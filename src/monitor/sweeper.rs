//! Background timeout sweeper.
//!
//! One elected process per fleet scans PROCESSING tasks that have
//! outlived `task_timeout_seconds`, transitions them to TIMEOUT, and
//! releases their global slots. TIMEOUT means "the provider did not
//! respond within budget", not "the provider is unhealthy"; a later retry
//! is expected to succeed.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::TaskMonitor;
use crate::config::EngineConfig;
use crate::limiter::ConcurrencyLimiter;

/// Spawn the sweeper loop. The returned handle aborts the loop on drop by
/// the caller; the loop itself runs until then.
pub fn spawn_sweeper(
    monitor: Arc<dyn TaskMonitor>,
    limiter: Arc<dyn ConcurrencyLimiter>,
    config: &EngineConfig,
) -> JoinHandle<()> {
    let interval = Duration::from_secs(config.sweep_interval_seconds.max(1));
    let task_timeout = Duration::from_secs(config.task_timeout_seconds);
    // The lease outlives two sweep periods so a paused holder does not
    // flap the election on every tick.
    let lease_ttl = interval * 2;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            match monitor.acquire_sweep_lease(lease_ttl).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "sweeper lease check failed");
                    continue;
                }
            }

            match monitor.sweep_timed_out(task_timeout).await {
                Ok(swept) => {
                    for text_id in swept {
                        tracing::warn!(text_id = %text_id, "task swept to timeout");
                        if let Err(e) = limiter.release(&text_id).await {
                            tracing::warn!(
                                text_id = %text_id,
                                error = %e,
                                "failed to release slot for swept task"
                            );
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "timeout sweep failed");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::limiter::LocalLimiter;
    use crate::monitor::memory::MemoryMonitor;
    use crate::monitor::{now_ms, Strategy, TaskStatus};

    #[tokio::test]
    async fn sweeper_times_out_stale_task_and_frees_slot() {
        let config = Config::default();
        let monitor = Arc::new(MemoryMonitor::new(&config));
        let limiter = Arc::new(LocalLimiter::new(1));

        monitor.start_task("t1", "h1", "u1").await.unwrap();
        assert!(limiter
            .acquire("t1", Duration::from_millis(10))
            .await
            .unwrap());
        monitor
            .begin_processing("t1", Strategy::Serial, 1)
            .await
            .unwrap();

        // Simulate a task stuck in PROCESSING past the budget, then run one
        // sweep cycle by hand (the spawned loop ticks every 60s).
        monitor.backdate_start("t1", now_ms() - 60_000);
        let swept = monitor
            .sweep_timed_out(Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(swept, vec!["t1".to_string()]);
        for text_id in &swept {
            limiter.release(text_id).await.unwrap();
        }

        let task = monitor.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Timeout);
        // Slot is free again.
        assert!(limiter
            .acquire("t2", Duration::from_millis(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn spawned_sweeper_can_be_aborted() {
        let config = Config::default();
        let monitor: Arc<dyn TaskMonitor> = Arc::new(MemoryMonitor::new(&config));
        let limiter: Arc<dyn ConcurrencyLimiter> = Arc::new(LocalLimiter::new(1));
        let handle = spawn_sweeper(monitor, limiter, &config.engine);
        handle.abort();
    }
}
