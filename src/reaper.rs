//! Periodic removal of vessels that stopped reporting.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::{
    config::ReaperConfig,
    database::VesselStore,
    errors::StoreError,
    models::fresh_cutoff,
};

pub struct StaleReaper {
    store: Arc<dyn VesselStore>,
    config: ReaperConfig,
}

impl StaleReaper {
    pub fn new(store: Arc<dyn VesselStore>, config: ReaperConfig) -> Self {
        Self { store, config }
    }

    /// Delete every vessel whose last report is older than the freshness
    /// window. Safe to run repeatedly and concurrently with writes.
    pub async fn reap_once(&self) -> Result<u64, StoreError> {
        let cutoff = fresh_cutoff(Utc::now());
        let deleted =
            tokio::time::timeout(self.config.store_timeout, self.store.delete_stale(cutoff)).await??;
        if deleted > 0 {
            info!("Removed {} stale vessels (last update before {})", deleted, cutoff);
        } else {
            debug!("No stale vessels");
        }
        Ok(deleted)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reap_once().await {
                        warn!("Stale vessel cleanup failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Stale reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeDelta};

    use super::*;
    use crate::database::{MemoryStore, VesselCounts, ViewportQuery};
    use crate::models::{Mmsi, VesselState};

    /// Memory store whose deletes never complete while `hang` is set
    #[derive(Default)]
    struct StuckStore {
        inner: MemoryStore,
        hang: AtomicBool,
    }

    #[async_trait]
    impl VesselStore for StuckStore {
        async fn upsert_batch(&self, batch: &[VesselState]) -> Result<u64, StoreError> {
            self.inner.upsert_batch(batch).await
        }

        async fn query_viewport(&self, query: &ViewportQuery) -> Result<Vec<VesselState>, StoreError> {
            self.inner.query_viewport(query).await
        }

        async fn delete_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.inner.delete_stale(cutoff).await
        }

        async fn counts(&self) -> Result<VesselCounts, StoreError> {
            self.inner.counts().await
        }
    }

    fn state(mmsi: u32, age_secs: i64) -> VesselState {
        let last_updated = Utc::now() - TimeDelta::seconds(age_secs);
        VesselState {
            mmsi: Mmsi::try_from(mmsi).unwrap(),
            latitude: 52.37,
            longitude: 4.9,
            course: None,
            speed: None,
            ship_type: None,
            geohash: "u173zq0".to_string(),
            geohash_bucket: "u173z".to_string(),
            last_updated,
            received_at: last_updated,
        }
    }

    fn reaper(store: Arc<MemoryStore>) -> StaleReaper {
        StaleReaper::new(
            store,
            ReaperConfig {
                interval: Duration::from_millis(10),
                store_timeout: Duration::from_secs(5),
            },
        )
    }

    #[tokio::test]
    async fn reap_removes_only_stale_vessels() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_batch(&[state(1, 10), state(2, 300), state(3, 3600)])
            .await
            .unwrap();
        let reaper = reaper(store.clone());

        assert_eq!(reaper.reap_once().await.unwrap(), 2);
        assert_eq!(reaper.reap_once().await.unwrap(), 0);
        assert!(store.get(Mmsi::try_from(1u32).unwrap()).is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn hung_delete_times_out() {
        let store = Arc::new(StuckStore::default());
        store.upsert_batch(&[state(1, 600)]).await.unwrap();
        store.hang.store(true, Ordering::SeqCst);
        let reaper = StaleReaper::new(
            store.clone(),
            ReaperConfig {
                interval: Duration::from_secs(60),
                store_timeout: Duration::from_millis(50),
            },
        );

        let result = tokio::time::timeout(Duration::from_secs(5), reaper.reap_once())
            .await
            .expect("reap did not time out");
        assert!(matches!(result, Err(StoreError::Timeout(_))));
        assert_eq!(store.inner.len(), 1);

        store.hang.store(false, Ordering::SeqCst);
        assert_eq!(reaper.reap_once().await.unwrap(), 1);
        assert!(store.inner.is_empty());
    }

    #[tokio::test]
    async fn run_reaps_until_shutdown() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_batch(&[state(1, 600)]).await.unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(reaper(store.clone()).run(rx));

        tokio::time::timeout(Duration::from_secs(2), async {
            while !store.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stale vessel was not removed");

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("reaper did not stop")
            .unwrap();
    }
}
