//! Data models.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{DecodeError, QueryError};
use crate::geohash;
use serde_helpers::*;

/// Maritime Mobile Service Identity (MMSI)
///
/// A unique nine-digit number for identifying vessels in AIS messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Mmsi(u32);

impl TryFrom<u32> for Mmsi {
    type Error = DecodeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if value == 0 || value > 999_999_999 {
            return Err(DecodeError::InvalidMmsi(value.to_string()));
        }
        Ok(Self(value))
    }
}

impl TryFrom<i64> for Mmsi {
    type Error = DecodeError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        let parsed =
            u32::try_from(value).map_err(|_| DecodeError::InvalidMmsi(value.to_string()))?;
        Self::try_from(parsed)
    }
}

impl Mmsi {
    /// Get the raw MMSI value
    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Rectangular viewport in WGS84 degrees.
///
/// Never wraps around the antimeridian: `min_lon < max_lon` and
/// `min_lat < max_lat` always hold for a constructed value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Result<Self, QueryError> {
        let coords = [min_lon, min_lat, max_lon, max_lat];
        if coords.iter().any(|c| !c.is_finite()) {
            return Err(QueryError::InvalidQuery(
                "bbox coordinates must be finite numbers".to_string(),
            ));
        }
        if !((-180.0..=180.0).contains(&min_lon) && (-180.0..=180.0).contains(&max_lon)) {
            return Err(QueryError::InvalidQuery(
                "longitude must be between -180 and 180".to_string(),
            ));
        }
        if !((-90.0..=90.0).contains(&min_lat) && (-90.0..=90.0).contains(&max_lat)) {
            return Err(QueryError::InvalidQuery(
                "latitude must be between -90 and 90".to_string(),
            ));
        }
        if min_lon >= max_lon || min_lat >= max_lat {
            return Err(QueryError::InvalidQuery(
                "min values must be less than max values".to_string(),
            ));
        }
        Ok(Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        })
    }

    /// Inclusive point-in-rectangle test.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&lat) && (self.min_lon..=self.max_lon).contains(&lon)
    }
}

/// Parses `minLon,minLat,maxLon,maxLat`.
impl FromStr for BoundingBox {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| QueryError::InvalidQuery(format!("invalid bbox number: {}", e)))?;

        match parts.as_slice() {
            [min_lon, min_lat, max_lon, max_lat] => {
                Self::new(*min_lon, *min_lat, *max_lon, *max_lat)
            }
            _ => Err(QueryError::InvalidQuery(
                "bbox must have four comma separated values".to_string(),
            )),
        }
    }
}

/// Maximum age of `last_updated` for a vessel to count as current.
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(120);

/// Oldest `last_updated` (exclusive) that is still fresh at `now`.
pub fn fresh_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - TimeDelta::seconds(FRESHNESS_WINDOW.as_secs() as i64)
}

/// How far an event time may run ahead of its receipt time before it is
/// distrusted.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(60);

/// Normalized position event waiting for the next batch write.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpdate {
    pub mmsi: Mmsi,
    pub latitude: f64,
    pub longitude: f64,
    /// Course over ground in degrees, 0 <= course < 360
    pub course: Option<f32>,
    /// Speed over ground in knots
    pub speed: Option<f32>,
    /// AIS ship type code
    pub ship_type: Option<u8>,
    /// Event time asserted by the source
    pub last_updated: DateTime<Utc>,
    /// When this process received the frame
    pub received_at: DateTime<Utc>,
}

/// Latest known state of one vessel, as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct VesselState {
    pub mmsi: Mmsi,
    pub latitude: f64,
    pub longitude: f64,
    pub course: Option<f32>,
    pub speed: Option<f32>,
    pub ship_type: Option<u8>,
    pub geohash: String,
    pub geohash_bucket: String,
    pub last_updated: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl VesselState {
    /// Build the row to be written for `update`, deriving both geohash
    /// columns from its position.
    pub fn from_update(update: &PendingUpdate, written_at: DateTime<Utc>) -> Self {
        let geohash = geohash::encode(update.latitude, update.longitude, geohash::FULL_PRECISION);
        let geohash_bucket = geohash::bucket_of(&geohash).to_string();

        Self {
            mmsi: update.mmsi,
            latitude: update.latitude,
            longitude: update.longitude,
            course: update.course,
            speed: update.speed,
            ship_type: update.ship_type,
            geohash,
            geohash_bucket,
            last_updated: update.last_updated,
            received_at: written_at,
        }
    }
}

/// Upstream frame, as sent by the aisstream.io WebSocket API.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamFrame {
    #[serde(rename = "MessageType")]
    pub message_type: String,
    #[serde(rename = "MetaData")]
    pub meta_data: FrameMetaData,
    #[serde(rename = "Message")]
    pub message: FrameMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrameMetaData {
    #[serde(rename = "MMSI")]
    pub mmsi: i64,
    /// Ship type, None if undefined (0)
    #[serde(rename = "ShipType", default, deserialize_with = "deserialize_ship_type")]
    pub ship_type: Option<u8>,
    /// Go-formatted timestamp, e.g. `2022-12-29 18:22:32.318353 +0000 UTC`
    #[serde(rename = "time_utc", default)]
    pub time_utc: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrameMessage {
    #[serde(rename = "PositionReport")]
    pub position_report: Option<PositionReport>,
}

/// Class A position report body
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PositionReport {
    #[serde(rename = "Latitude")]
    pub latitude: f64,
    #[serde(rename = "Longitude")]
    pub longitude: f64,
    /// Course over ground in degrees, None if not available (360) or out of range
    #[serde(rename = "Cog", default, deserialize_with = "deserialize_cog")]
    pub cog: Option<f32>,
    /// Speed over ground in knots, None if not available (=102.3) or negative
    #[serde(rename = "Sog", default, deserialize_with = "deserialize_sog")]
    pub sog: Option<f32>,
}

pub const POSITION_REPORT: &str = "PositionReport";

impl StreamFrame {
    /// Decode a frame payload; upstream sends JSON in both text and binary
    /// frames.
    pub fn parse(payload: impl AsRef<[u8]>) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(payload.as_ref())?)
    }

    /// Normalize into a pending update.
    ///
    /// `received_at` stands in for the event time when the frame carries no
    /// usable `time_utc`.
    pub fn into_update(self, received_at: DateTime<Utc>) -> Result<PendingUpdate, DecodeError> {
        if self.message_type != POSITION_REPORT {
            return Err(DecodeError::UnknownMessageType(self.message_type));
        }
        let report = self
            .message
            .position_report
            .ok_or(DecodeError::MissingPositionReport)?;
        let mmsi = Mmsi::try_from(self.meta_data.mmsi)?;

        if !(-90.0..=90.0).contains(&report.latitude)
            || !(-180.0..=180.0).contains(&report.longitude)
        {
            return Err(DecodeError::PositionOutOfRange {
                lat: report.latitude,
                lon: report.longitude,
            });
        }

        let max_event_time = received_at + TimeDelta::seconds(MAX_CLOCK_SKEW.as_secs() as i64);
        let last_updated = match self.meta_data.time_utc.as_deref().map(parse_time_utc) {
            // event time never leads receipt by more than MAX_CLOCK_SKEW
            Some(Some(time)) if time > max_event_time => {
                tracing::warn!(
                    "time_utc {} for MMSI {} is ahead of receipt time {}, using receipt time",
                    time,
                    mmsi.value(),
                    received_at
                );
                received_at
            }
            Some(Some(time)) => time,
            Some(None) => {
                tracing::warn!(
                    "Unparseable time_utc {:?} for MMSI {}, using receipt time",
                    self.meta_data.time_utc,
                    mmsi.value()
                );
                received_at
            }
            None => received_at,
        };

        Ok(PendingUpdate {
            mmsi,
            latitude: report.latitude,
            longitude: report.longitude,
            course: report.cog,
            speed: report.sog,
            ship_type: self.meta_data.ship_type,
            last_updated,
            received_at,
        })
    }
}

/// Parse the upstream `time_utc` field, falling back to RFC 3339.
pub fn parse_time_utc(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim().trim_end_matches(" UTC");
    DateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f %z")
        .or_else(|_| DateTime::parse_from_rfc3339(trimmed))
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

/// Custom deserializers
mod serde_helpers {
    use serde::{self, Deserialize, Deserializer};

    pub fn deserialize_sog<'de, D>(deserializer: D) -> Result<Option<f32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<f32>::deserialize(deserializer)?;
        Ok(value.filter(|v| *v >= 0.0 && *v != 102.3))
    }

    pub fn deserialize_cog<'de, D>(deserializer: D) -> Result<Option<f32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<f32>::deserialize(deserializer)?;
        Ok(value.filter(|v| (0.0..360.0).contains(v)))
    }

    pub fn deserialize_ship_type<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<u8>::deserialize(deserializer)?;
        Ok(value.filter(|v| *v != 0))
    }
}
