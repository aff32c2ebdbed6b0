use chrono::{DateTime, Utc};

use crate::errors::StoreError;
use crate::models::{Mmsi, VesselState};

#[derive(Debug, sqlx::FromRow)]
pub(super) struct VesselRow {
    mmsi: i32,
    latitude: f64,
    longitude: f64,
    course: Option<f32>,
    speed: Option<f32>,
    ship_type: Option<i16>,
    geohash: String,
    geohash_5: String,
    last_updated: DateTime<Utc>,
    received_at: DateTime<Utc>,
}

impl TryFrom<VesselRow> for VesselState {
    type Error = StoreError;

    fn try_from(row: VesselRow) -> Result<Self, Self::Error> {
        let mmsi = Mmsi::try_from(i64::from(row.mmsi))
            .map_err(|e| StoreError::InvalidRow(e.to_string()))?;

        Ok(Self {
            mmsi,
            latitude: row.latitude,
            longitude: row.longitude,
            course: row.course,
            speed: row.speed,
            ship_type: row.ship_type.and_then(|t| u8::try_from(t).ok()),
            geohash: row.geohash,
            geohash_bucket: row.geohash_5,
            last_updated: row.last_updated,
            received_at: row.received_at,
        })
    }
}
