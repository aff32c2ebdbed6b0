//! Ingest counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::info;

#[derive(Debug)]
pub struct IngestStats {
    started: Instant,
    pub messages_received: AtomicU64,
    pub position_reports: AtomicU64,
    pub decode_errors: AtomicU64,
    pub reconnects: AtomicU64,
    pub vessels_written: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub updates_dropped: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub messages_received: u64,
    pub position_reports: u64,
    pub decode_errors: u64,
    pub reconnects: u64,
    pub vessels_written: u64,
    pub batches_flushed: u64,
    pub updates_dropped: u64,
}

impl IngestStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            messages_received: AtomicU64::new(0),
            position_reports: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            vessels_written: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            updates_dropped: AtomicU64::new(0),
        })
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            position_reports: self.position_reports.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            vessels_written: self.vessels_written.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            updates_dropped: self.updates_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn log(&self, pending: usize) {
        let s = self.snapshot();
        let elapsed = self.started.elapsed().as_secs_f64().max(f64::EPSILON);
        info!(
            "Stats: {} msgs ({:.1}/s) | {} positions ({:.1}/s) | {} vessels written in {} batches | pending {} | decode errors {} | dropped {} | reconnects {}",
            s.messages_received,
            s.messages_received as f64 / elapsed,
            s.position_reports,
            s.position_reports as f64 / elapsed,
            s.vessels_written,
            s.batches_flushed,
            pending,
            s.decode_errors,
            s.updates_dropped,
            s.reconnects,
        );
    }
}

/// Log stats every `every` until shutdown.
pub async fn log_periodically(
    stats: Arc<IngestStats>,
    buffer: crate::buffer::UpdateBuffer,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => stats.log(buffer.len()),
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = IngestStats::new();
        IngestStats::incr(&stats.messages_received);
        IngestStats::incr(&stats.messages_received);
        IngestStats::add(&stats.vessels_written, 5);

        let s = stats.snapshot();
        assert_eq!(s.messages_received, 2);
        assert_eq!(s.vessels_written, 5);
        assert_eq!(s.decode_errors, 0);
    }
}
