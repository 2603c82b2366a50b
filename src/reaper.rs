use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::Engine;
use crate::store::WalStore;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Periodic cleanup of expired leases.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let swept = engine.sweep_expired().await;
                if swept > 0 {
                    info!("swept {swept} expired leases");
                }
            }
        }
    }
}

/// Compact the booking log once enough records have piled up since the last compaction.
pub async fn run_compactor(store: Arc<WalStore>, threshold: u64, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let appends = store.appends_since_compact().await;
                if appends < threshold {
                    continue;
                }
                match store.compact().await {
                    Ok(()) => info!("compacted booking WAL after {appends} appends"),
                    Err(e) => tracing::error!("booking WAL compaction failed: {e}"),
                }
            }
        }
    }
}

/// Owns the background tasks. Started at init, stopped at shutdown.
pub struct Reaper {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Reaper {
    pub fn start(
        engine: Arc<Engine>,
        store: Arc<WalStore>,
        sweep_interval: Duration,
        compact_threshold: u64,
    ) -> Self {
        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(run_sweeper(engine, sweep_interval, cancel.child_token())),
            tokio::spawn(run_compactor(
                store,
                compact_threshold,
                COMPACT_CHECK_INTERVAL,
                cancel.child_token(),
            )),
        ];
        Self { cancel, tasks }
    }

    /// Signal both tasks and wait for them to finish their current tick.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!("reaper task ended abnormally: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::engine::EngineConfig;
    use crate::model::{SlotKey, TimeOfDay};
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotlock_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    const CATALOG: &str = r#"{
        "services": [{"id": "01HZX5Q8W6T3V2N1M0K9J8H7G6", "name": "Haircut"}],
        "schedules": [{"day": "Mon", "intervals": [{"start": "09:00", "end": "12:00"}]}]
    }"#;

    fn engine(store: Arc<WalStore>, ttl_ms: i64) -> Arc<Engine> {
        Arc::new(Engine::new(
            store,
            Arc::new(Catalog::from_json(CATALOG).unwrap()),
            Arc::new(NotifyHub::new()),
            EngineConfig { lease_ttl_ms: ttl_ms, slot_minutes: 30 },
        ))
    }

    #[tokio::test]
    async fn sweeper_removes_expired_leases() {
        let store = Arc::new(WalStore::open(&test_wal_path("sweeper.wal")).unwrap());
        let engine = engine(store.clone(), 20);
        let slot = SlotKey::new(
            "01HZX5Q8W6T3V2N1M0K9J8H7G6".parse().unwrap(),
            chrono::NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
            TimeOfDay::hm(9, 0).unwrap(),
        );
        engine.acquire(slot, Ulid::new()).await.unwrap();
        assert_eq!(engine.locks.active_lease_count(), 1);

        let reaper = Reaper::start(engine.clone(), store, Duration::from_millis(10), 1000);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.locks.active_lease_count(), 0);
        reaper.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_tasks_promptly() {
        let store = Arc::new(WalStore::open(&test_wal_path("shutdown.wal")).unwrap());
        let engine = engine(store.clone(), 300_000);
        let reaper = Reaper::start(engine, store, Duration::from_secs(3600), 1000);
        tokio::time::timeout(Duration::from_secs(1), reaper.shutdown())
            .await
            .expect("reaper did not stop");
    }
}
