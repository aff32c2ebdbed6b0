//! End to end: decoded frames through the writer into the store and back out
//! through viewport queries.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use ais_tracker::{
    buffer::UpdateBuffer,
    config::{ReaperConfig, StreamConfig, WriterConfig},
    database::{MemoryStore, VesselStore},
    models::{BoundingBox, Mmsi},
    query::QueryService,
    reaper::StaleReaper,
    stats::IngestStats,
    stream::StreamIngestor,
    writer::{BatchWriter, FlushOutcome},
};

struct Pipeline {
    store: Arc<MemoryStore>,
    ingestor: StreamIngestor,
    writer: BatchWriter,
    query: QueryService,
}

impl Pipeline {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let buffer = UpdateBuffer::default();
        let stats = IngestStats::new();
        let stream_config = StreamConfig {
            url: "ws://127.0.0.1:1".to_string(),
            api_key: "test".to_string(),
            bounding_boxes: Vec::new(),
            connect_timeout: Duration::from_secs(1),
            backoff_initial_ms: 10,
            backoff_max_ms: 100,
        };

        Self {
            ingestor: StreamIngestor::new(stream_config, buffer.clone(), stats.clone()),
            writer: BatchWriter::new(store.clone(), buffer, WriterConfig::default(), stats),
            query: QueryService::new(store.clone()),
            store,
        }
    }

    fn receive(&self, mmsi: u32, lat: f64, lon: f64, time: DateTime<Utc>) {
        let frame = serde_json::json!({
            "MessageType": "PositionReport",
            "MetaData": {
                "MMSI": mmsi,
                "ShipType": 70,
                "time_utc": time.format("%Y-%m-%d %H:%M:%S%.f +0000 UTC").to_string(),
            },
            "Message": {
                "PositionReport": {"Latitude": lat, "Longitude": lon, "Cog": 90.0, "Sog": 5.2}
            }
        });
        self.ingestor
            .handle_payload(frame.to_string().as_bytes())
            .unwrap();
    }
}

fn amsterdam() -> BoundingBox {
    "4.85,52.30,4.95,52.45".parse().unwrap()
}

fn mmsi(value: u32) -> Mmsi {
    Mmsi::try_from(value).unwrap()
}

#[tokio::test]
async fn snapshot_then_empty_delta() {
    let mut p = Pipeline::new();
    let t0 = Utc::now() - TimeDelta::seconds(5);

    p.receive(123456789, 52.37, 4.9, t0);
    assert!(matches!(p.writer.flush().await, FlushOutcome::Written { vessels: 1, .. }));

    let snapshot = p.query.query(amsterdam(), 13, None).await.unwrap();
    assert!(!snapshot.is_delta);
    assert_eq!(snapshot.count, 1);
    let vessel = &snapshot.vessels[0];
    assert_eq!(vessel.mmsi.value(), 123456789);
    assert_eq!(vessel.latitude, 52.37);
    assert_eq!(vessel.longitude, 4.9);
    assert_eq!(vessel.speed, Some(5.2));
    assert_eq!(vessel.course, Some(90.0));
    assert_eq!(vessel.ship_type, Some(70));

    let delta = p
        .query
        .query(amsterdam(), 13, Some(snapshot.server_time))
        .await
        .unwrap();
    assert!(delta.is_delta);
    assert_eq!(delta.count, 0);
    assert!(delta.server_time >= snapshot.server_time);
}

#[tokio::test]
async fn out_of_order_events_in_one_window() {
    let mut p = Pipeline::new();
    let t1 = Utc::now() - TimeDelta::seconds(1);
    let t0 = t1 - TimeDelta::seconds(10);

    p.receive(123456789, 52.38, 4.91, t1);
    p.receive(123456789, 52.37, 4.90, t0);
    p.writer.flush().await;

    let stored = p.store.get(mmsi(123456789)).unwrap();
    assert_eq!(stored.last_updated.timestamp_micros(), t1.timestamp_micros());
    assert_eq!(stored.latitude, 52.38);
}

#[tokio::test]
async fn older_event_in_later_batch_is_ignored() {
    let mut p = Pipeline::new();
    let t1 = Utc::now() - TimeDelta::seconds(1);
    let t0 = t1 - TimeDelta::seconds(10);

    p.receive(123456789, 52.38, 4.91, t1);
    p.writer.flush().await;
    p.receive(123456789, 52.37, 4.90, t0);
    assert_eq!(
        p.writer.flush().await,
        FlushOutcome::Written {
            vessels: 1,
            applied: 0
        }
    );

    let stored = p.store.get(mmsi(123456789)).unwrap();
    assert_eq!(stored.latitude, 52.38);
}

#[tokio::test]
async fn reapplying_an_event_changes_nothing_visible() {
    let mut p = Pipeline::new();
    let t = Utc::now() - TimeDelta::seconds(2);

    p.receive(123456789, 52.37, 4.9, t);
    p.writer.flush().await;
    let first = p.query.query(amsterdam(), 15, None).await.unwrap();

    p.receive(123456789, 52.37, 4.9, t);
    p.writer.flush().await;
    let second = p.query.query(amsterdam(), 15, None).await.unwrap();

    assert_eq!(first.vessels, second.vessels);
    assert_eq!(p.store.len(), 1);
}

#[tokio::test]
async fn delta_reports_only_vessels_updated_since_cursor() {
    let mut p = Pipeline::new();
    let now = Utc::now();

    p.receive(111111111, 52.37, 4.90, now - TimeDelta::seconds(30));
    p.receive(222222222, 52.40, 4.92, now - TimeDelta::seconds(30));
    p.writer.flush().await;
    let snapshot = p.query.query(amsterdam(), 13, None).await.unwrap();
    assert_eq!(snapshot.count, 2);

    // event time after the previous server_time
    let later = snapshot.server_time + TimeDelta::milliseconds(1);
    p.receive(222222222, 52.41, 4.93, later);
    p.writer.flush().await;

    let delta = p
        .query
        .query(amsterdam(), 13, Some(snapshot.server_time))
        .await
        .unwrap();
    assert!(delta.is_delta);
    assert_eq!(delta.count, 1);
    assert_eq!(delta.vessels[0].mmsi.value(), 222222222);
    assert_eq!(delta.vessels[0].latitude, 52.41);
}

#[tokio::test]
async fn stale_vessels_disappear_and_get_reaped() {
    let mut p = Pipeline::new();
    let now = Utc::now();

    p.receive(111111111, 52.37, 4.90, now);
    p.receive(222222222, 52.38, 4.91, now - TimeDelta::seconds(600));
    p.writer.flush().await;

    let snapshot = p.query.query(amsterdam(), 13, None).await.unwrap();
    assert_eq!(snapshot.count, 1);
    assert_eq!(snapshot.vessels[0].mmsi.value(), 111111111);

    let reaper = StaleReaper::new(p.store.clone(), ReaperConfig::default());
    assert_eq!(reaper.reap_once().await.unwrap(), 1);
    assert_eq!(reaper.reap_once().await.unwrap(), 0);

    let counts = p.store.counts().await.unwrap();
    assert_eq!(counts.total, 1);
    assert_eq!(counts.fresh, 1);
}

#[tokio::test]
async fn zoomed_out_viewport_is_empty() {
    let mut p = Pipeline::new();
    p.receive(123456789, 52.37, 4.9, Utc::now());
    p.writer.flush().await;

    let response = p
        .query
        .query(amsterdam(), 11, Some(Utc::now() - TimeDelta::seconds(60)))
        .await
        .unwrap();
    assert_eq!(response.count, 0);
    assert!(!response.is_delta);
}

#[tokio::test]
async fn future_dated_event_does_not_pin_vessel() {
    let mut p = Pipeline::new();

    p.receive(123456789, 52.31, 4.88, Utc::now() + TimeDelta::hours(6));
    p.writer.flush().await;
    let pinned = p.store.get(mmsi(123456789)).unwrap();
    assert!(pinned.last_updated <= Utc::now());

    tokio::time::sleep(Duration::from_millis(5)).await;
    p.receive(123456789, 52.37, 4.90, Utc::now());
    assert!(matches!(
        p.writer.flush().await,
        FlushOutcome::Written { applied: 1, .. }
    ));

    let snapshot = p.query.query(amsterdam(), 13, None).await.unwrap();
    assert_eq!(snapshot.count, 1);
    assert_eq!(snapshot.vessels[0].latitude, 52.37);
}
