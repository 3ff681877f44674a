//! Background cleanup task.
//!
//! Periodically sweeps expired KV entries (presence records, stale sets)
//! and evicts idle rate-limiter keys.

use crate::config::CleanupConfig;
use crate::kv::KeyValueStore;
use crate::limits::RateLimits;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// Run one cleanup pass. Returns the number of KV entries removed.
pub async fn run_cleanup(kv: &dyn KeyValueStore, limits: &RateLimits) -> usize {
    limits.shrink();
    match kv.sweep_expired().await {
        Ok(removed) => {
            if removed > 0 {
                tracing::info!("Cleanup: removed {} expired kv entries", removed);
            } else {
                tracing::debug!("Cleanup: no expired kv entries");
            }
            removed
        }
        Err(e) => {
            tracing::error!("Cleanup error: {}", e);
            0
        }
    }
}

/// Spawn a background cleanup task.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_task(
    kv: Arc<dyn KeyValueStore>,
    limits: RateLimits,
    config: CleanupConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Cleanup task disabled");
            return;
        }

        let interval_secs = config.interval_secs.max(1);
        tracing::info!("Cleanup task started (interval: {}s)", interval_secs);

        let mut timer = interval(Duration::from_secs(interval_secs));

        loop {
            timer.tick().await;
            run_cleanup(kv.as_ref(), &limits).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use crate::kv::MemoryStore;

    #[tokio::test(start_paused = true)]
    async fn cleanup_removes_expired_entries() {
        let kv = MemoryStore::new();
        let limits = RateLimits::new(&LimitsConfig::default());
        kv.set("short", "v".into(), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        kv.set("forever", "v".into(), None).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(run_cleanup(&kv, &limits).await, 1);
        assert_eq!(kv.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_task_runs_on_interval() {
        let kv = Arc::new(MemoryStore::new());
        kv.set("short", "v".into(), Some(Duration::from_secs(1)))
            .await
            .unwrap();

        let handle = spawn_cleanup_task(
            kv.clone(),
            RateLimits::new(&LimitsConfig::default()),
            CleanupConfig {
                interval_secs: 5,
                enabled: true,
            },
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(kv.is_empty());
        handle.abort();
    }

    #[tokio::test]
    async fn cleanup_task_disabled() {
        let config = CleanupConfig {
            interval_secs: 1,
            enabled: false,
        };

        let handle = spawn_cleanup_task(
            Arc::new(MemoryStore::new()),
            RateLimits::new(&LimitsConfig::default()),
            config,
        );

        // Task should complete immediately when disabled
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("Task should complete when disabled")
            .expect("Task should not panic");
    }
}
