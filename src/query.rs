//! Viewport queries: full snapshots and deltas since a cursor.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::{
    database::{VesselStore, ViewportQuery},
    errors::QueryError,
    geohash::{self, BUCKET_PRECISION},
    models::{fresh_cutoff, Mmsi, VesselState},
};

pub use crate::models::BoundingBox;

/// Viewports zoomed out further than this are answered with no vessels.
pub const MIN_ZOOM: u8 = 12;

pub const MAX_ZOOM: u8 = 20;

/// Most buckets one query prunes on. Wider viewports are filtered by
/// rectangle alone.
pub const MAX_BUCKETS: usize = 4096;

/// One vessel as returned to clients
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VesselView {
    pub mmsi: Mmsi,
    pub latitude: f64,
    pub longitude: f64,
    pub course: Option<f32>,
    pub speed: Option<f32>,
    pub ship_type: Option<u8>,
    pub last_updated: DateTime<Utc>,
}

impl From<VesselState> for VesselView {
    fn from(v: VesselState) -> Self {
        Self {
            mmsi: v.mmsi,
            latitude: v.latitude,
            longitude: v.longitude,
            course: v.course,
            speed: v.speed,
            ship_type: v.ship_type,
            last_updated: v.last_updated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VesselsResponse {
    pub vessels: Vec<VesselView>,
    /// Pass back as `since` on the next poll
    pub server_time: DateTime<Utc>,
    pub count: usize,
    pub is_delta: bool,
}

impl VesselsResponse {
    fn new(vessels: Vec<VesselView>, server_time: DateTime<Utc>, is_delta: bool) -> Self {
        Self {
            count: vessels.len(),
            vessels,
            server_time,
            is_delta,
        }
    }
}

#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn VesselStore>,
}

impl QueryService {
    pub fn new(store: Arc<dyn VesselStore>) -> Self {
        Self { store }
    }

    /// Fresh vessels inside `bbox`, optionally only those updated after
    /// `since`.
    ///
    /// `server_time` is taken before the store is read, so a vessel written
    /// while the query runs is returned again by the next delta rather than
    /// missed.
    pub async fn query(
        &self,
        bbox: BoundingBox,
        zoom: u8,
        since: Option<DateTime<Utc>>,
    ) -> Result<VesselsResponse, QueryError> {
        if zoom > MAX_ZOOM {
            return Err(QueryError::InvalidQuery(format!(
                "zoom must be between 0 and {}",
                MAX_ZOOM
            )));
        }

        let server_time = Utc::now();
        if zoom < MIN_ZOOM {
            debug!("Zoom {} below {}, returning no vessels", zoom, MIN_ZOOM);
            return Ok(VesselsResponse::new(Vec::new(), server_time, false));
        }

        let buckets = match geohash::buckets_in(&bbox, BUCKET_PRECISION, MAX_BUCKETS) {
            Ok(buckets) => Some(buckets),
            Err(e) => {
                debug!(
                    "Viewport spans {} geohash cells (limit {}), filtering by rectangle only",
                    e.needed, e.limit
                );
                None
            }
        };

        let query = ViewportQuery {
            buckets,
            bbox,
            fresh_after: fresh_cutoff(server_time),
            since,
        };
        let vessels: Vec<VesselView> = self
            .store
            .query_viewport(&query)
            .await?
            .into_iter()
            .map(VesselView::from)
            .collect();

        debug!(
            "Viewport query: {} buckets, {} vessels, delta={}",
            query.buckets.as_ref().map_or(0, Vec::len),
            vessels.len(),
            since.is_some()
        );
        Ok(VesselsResponse::new(vessels, server_time, since.is_some()))
    }
}
