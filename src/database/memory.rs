use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{VesselCounts, VesselStore, ViewportQuery};
use crate::errors::StoreError;
use crate::models::{fresh_cutoff, Mmsi, VesselState};

/// In-process vessel store with the same conditional write semantics as
/// [`super::Database`]. Selected with `database.url = "memory"`.
#[derive(Default)]
pub struct MemoryStore {
    vessels: RwLock<HashMap<Mmsi, VesselState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored state of one vessel.
    pub fn get(&self, mmsi: Mmsi) -> Option<VesselState> {
        self.read().get(&mmsi).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Mmsi, VesselState>> {
        self.vessels.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Mmsi, VesselState>> {
        self.vessels.write().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl VesselStore for MemoryStore {
    async fn upsert_batch(&self, batch: &[VesselState]) -> Result<u64, StoreError> {
        let mut vessels = self.write();
        let mut applied = 0;
        for vessel in batch {
            match vessels.entry(vessel.mmsi) {
                Entry::Vacant(slot) => {
                    slot.insert(vessel.clone());
                    applied += 1;
                }
                Entry::Occupied(mut slot) => {
                    if slot.get().last_updated <= vessel.last_updated {
                        slot.insert(vessel.clone());
                        applied += 1;
                    }
                }
            }
        }
        Ok(applied)
    }

    async fn query_viewport(&self, query: &ViewportQuery) -> Result<Vec<VesselState>, StoreError> {
        let mut found: Vec<VesselState> = self
            .read()
            .values()
            .filter(|v| query.matches(v))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        Ok(found)
    }

    async fn delete_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut vessels = self.write();
        let before = vessels.len();
        vessels.retain(|_, v| v.last_updated >= cutoff);
        Ok((before - vessels.len()) as u64)
    }

    async fn counts(&self) -> Result<VesselCounts, StoreError> {
        let cutoff = fresh_cutoff(Utc::now());
        let vessels = self.read();
        let fresh = vessels.values().filter(|v| v.last_updated > cutoff).count();
        Ok(VesselCounts {
            total: vessels.len() as i64,
            fresh: fresh as i64,
        })
    }
}
