//! Batch writer
//!
//! Drains the update buffer on a timer, keeps the newest event per vessel
//! and writes the survivors with one conditional upsert. Updates from a
//! failed flush are merged in front of the next drain until they have
//! failed `max_retries + 1` times, after which they are dropped and logged
//! as a data gap.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::{
    buffer::UpdateBuffer,
    config::WriterConfig,
    database::VesselStore,
    errors::StoreError,
    models::{Mmsi, PendingUpdate, VesselState},
    stats::IngestStats,
};

/// Result of one flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing pending, the store was not touched
    Idle,
    /// `vessels` rows submitted, `applied` of them inserted or updated
    Written { vessels: usize, applied: u64 },
    /// The write failed; `retained` updates wait for the next flush
    Failed { retained: usize, dropped: usize },
}

#[derive(Debug)]
struct Retained {
    update: PendingUpdate,
    failures: u32,
}

impl From<PendingUpdate> for Retained {
    fn from(update: PendingUpdate) -> Self {
        Self {
            update,
            failures: 0,
        }
    }
}

pub struct BatchWriter {
    store: Arc<dyn VesselStore>,
    buffer: UpdateBuffer,
    config: WriterConfig,
    stats: Arc<IngestStats>,
    retained: Vec<Retained>,
}

impl BatchWriter {
    pub fn new(
        store: Arc<dyn VesselStore>,
        buffer: UpdateBuffer,
        config: WriterConfig,
        stats: Arc<IngestStats>,
    ) -> Self {
        info!(
            "Initializing BatchWriter: flush_interval={:?}, max_retries={}, high_water={}",
            config.flush_interval, config.max_retries, config.high_water
        );
        Self {
            store,
            buffer,
            config,
            stats,
            retained: Vec::new(),
        }
    }

    /// Updates held back by failed flushes.
    pub fn retained(&self) -> usize {
        self.retained.len()
    }

    /// Flush on every tick or high-water wake-up until `shutdown`, then
    /// flush one last time.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush().await;
                }
                _ = self.buffer.high_water_reached() => {
                    debug!("High-water mark reached, flushing early");
                    self.flush().await;
                    ticker.reset();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Performing final flush");
        if let FlushOutcome::Failed { retained, .. } = self.flush().await {
            error!("Final flush failed, {} vessel updates lost (data gap)", retained);
            IngestStats::add(&self.stats.updates_dropped, retained as u64);
        }
        info!("Batch writer stopped");
    }

    /// Drain the buffer and write it.
    pub async fn flush(&mut self) -> FlushOutcome {
        let drained = self.buffer.take();
        if drained.is_empty() && self.retained.is_empty() {
            return FlushOutcome::Idle;
        }

        let batch = latest_per_vessel(std::mem::take(&mut self.retained), drained);
        let written_at = Utc::now();
        let rows: Vec<VesselState> = batch
            .iter()
            .map(|r| VesselState::from_update(&r.update, written_at))
            .collect();

        match self.write(&rows).await {
            Ok(applied) => {
                IngestStats::add(&self.stats.vessels_written, applied);
                IngestStats::incr(&self.stats.batches_flushed);
                let lag = batch
                    .iter()
                    .map(|r| written_at - r.update.received_at)
                    .max()
                    .unwrap_or_else(TimeDelta::zero);
                debug!(
                    "Batch upserted: {} vessels, {} applied, max ingest lag {}ms",
                    rows.len(),
                    applied,
                    lag.num_milliseconds()
                );
                FlushOutcome::Written {
                    vessels: rows.len(),
                    applied,
                }
            }
            Err(e) => {
                let mut dropped = 0;
                for mut r in batch {
                    r.failures += 1;
                    if r.failures > self.config.max_retries {
                        dropped += 1;
                    } else {
                        self.retained.push(r);
                    }
                }
                warn!(
                    "Batch upsert of {} vessels failed, {} retained for retry: {}",
                    rows.len(),
                    self.retained.len(),
                    e
                );
                if dropped > 0 {
                    error!(
                        "Dropped {} vessel updates after {} failed flushes (data gap)",
                        dropped,
                        self.config.max_retries + 1
                    );
                    IngestStats::add(&self.stats.updates_dropped, dropped as u64);
                }
                FlushOutcome::Failed {
                    retained: self.retained.len(),
                    dropped,
                }
            }
        }
    }

    async fn write(&self, rows: &[VesselState]) -> Result<u64, StoreError> {
        tokio::time::timeout(self.config.store_timeout, self.store.upsert_batch(rows)).await?
    }
}

/// Keep the entry with the greatest event time per vessel; on equal times
/// the later arrival wins. `retained` counts as arriving first.
fn latest_per_vessel(retained: Vec<Retained>, drained: Vec<PendingUpdate>) -> Vec<Retained> {
    let mut latest: HashMap<Mmsi, Retained> = HashMap::with_capacity(retained.len() + drained.len());

    for candidate in retained
        .into_iter()
        .chain(drained.into_iter().map(Retained::from))
    {
        match latest.entry(candidate.update.mmsi) {
            Entry::Vacant(slot) => {
                slot.insert(candidate);
            }
            Entry::Occupied(mut slot) => {
                if candidate.update.last_updated >= slot.get().update.last_updated {
                    slot.insert(candidate);
                }
            }
        }
    }

    // sorted so concurrent batches lock rows in the same order
    let mut batch: Vec<Retained> = latest.into_values().collect();
    batch.sort_unstable_by_key(|r| r.update.mmsi);
    batch
}
