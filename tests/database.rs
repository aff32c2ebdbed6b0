//! PostgreSQL store tests. Need a PostGIS enabled server at `DATABASE_URL`
//! (a `.env` file is honored) and `--features db-tests`.
#![cfg(feature = "db-tests")]

use std::env;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use sqlx::PgPool;

use ais_tracker::{
    config::DatabaseConfig,
    database::{Database, VesselStore, ViewportQuery},
    geohash,
    models::{fresh_cutoff, BoundingBox, Mmsi, PendingUpdate, VesselState},
};

fn vessel(mmsi: u32, lat: f64, lon: f64, last_updated: DateTime<Utc>) -> VesselState {
    let update = PendingUpdate {
        mmsi: Mmsi::try_from(mmsi).unwrap(),
        latitude: lat,
        longitude: lon,
        course: Some(123.4),
        speed: Some(10.5),
        ship_type: Some(70),
        last_updated,
        received_at: last_updated,
    };
    VesselState::from_update(&update, Utc::now().trunc_subsecs(6))
}

fn now() -> DateTime<Utc> {
    // Postgres keeps microseconds
    Utc::now().trunc_subsecs(6)
}

fn viewport(bbox: BoundingBox, since: Option<DateTime<Utc>>) -> ViewportQuery {
    ViewportQuery {
        buckets: Some(geohash::buckets_in(&bbox, geohash::BUCKET_PRECISION, 4096).unwrap()),
        bbox,
        fresh_after: fresh_cutoff(Utc::now()),
        since,
    }
}

#[sqlx::test]
async fn test_upsert_and_read_back(pool: PgPool) {
    let db = Database::new(pool.clone()).await.unwrap();
    let t = now();

    let applied = db
        .upsert_batch(&[vessel(230123456, 60.192059, 24.945831, t)])
        .await
        .unwrap();
    assert_eq!(applied, 1);

    let stored: (f64, f64, String, String, DateTime<Utc>) = sqlx::query_as(
        "SELECT ST_Y(location::geometry), ST_X(location::geometry), geohash, geohash_5, last_updated
         FROM vessels WHERE mmsi = $1",
    )
    .bind(230123456i32)
    .fetch_one(&pool)
    .await
    .unwrap();

    assert!((stored.0 - 60.192059).abs() < 1e-9);
    assert!((stored.1 - 24.945831).abs() < 1e-9);
    assert_eq!(stored.2, geohash::encode(60.192059, 24.945831, 7));
    assert_eq!(stored.3, &stored.2[..5]);
    assert_eq!(stored.4, t);
}

#[sqlx::test]
async fn test_older_write_does_not_regress(pool: PgPool) {
    let db = Database::new(pool.clone()).await.unwrap();
    let t1 = now();
    let t0 = t1 - TimeDelta::seconds(10);

    db.upsert_batch(&[vessel(230123456, 60.2, 24.9, t1)]).await.unwrap();
    let applied = db
        .upsert_batch(&[vessel(230123456, 60.1, 24.8, t0)])
        .await
        .unwrap();
    assert_eq!(applied, 0);

    let (lat, last_updated): (f64, DateTime<Utc>) =
        sqlx::query_as("SELECT latitude, last_updated FROM vessels WHERE mmsi = $1")
            .bind(230123456i32)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(lat, 60.2);
    assert_eq!(last_updated, t1);

    // equal timestamps are applied
    let applied = db
        .upsert_batch(&[vessel(230123456, 60.3, 24.9, t1)])
        .await
        .unwrap();
    assert_eq!(applied, 1);
}

#[sqlx::test]
async fn test_viewport_snapshot_and_delta(pool: PgPool) {
    let db = Database::new(pool).await.unwrap();
    let t = now();
    db.upsert_batch(&[
        vessel(111111111, 52.37, 4.90, t - TimeDelta::seconds(30)),
        vessel(222222222, 52.40, 4.92, t),
        vessel(333333333, 52.50, 4.90, t),
        vessel(444444444, 52.38, 4.91, t - TimeDelta::seconds(600)),
    ])
    .await
    .unwrap();
    let bbox = BoundingBox::new(4.85, 52.30, 4.95, 52.45).unwrap();

    let snapshot = db.query_viewport(&viewport(bbox, None)).await.unwrap();
    let mmsis: Vec<u32> = snapshot.iter().map(|v| v.mmsi.value()).collect();
    assert_eq!(mmsis, vec![222222222, 111111111]);
    assert_eq!(snapshot[0].ship_type, Some(70));
    assert_eq!(snapshot[0].speed, Some(10.5));

    let delta = db
        .query_viewport(&viewport(bbox, Some(t - TimeDelta::seconds(10))))
        .await
        .unwrap();
    assert_eq!(delta.len(), 1);
    assert_eq!(delta[0].mmsi.value(), 222222222);

    let unpruned = ViewportQuery {
        buckets: None,
        ..viewport(bbox, None)
    };
    assert_eq!(db.query_viewport(&unpruned).await.unwrap().len(), 2);
}

#[sqlx::test]
async fn test_delete_stale_and_counts(pool: PgPool) {
    let db = Database::new(pool).await.unwrap();
    let t = now();
    db.upsert_batch(&[
        vessel(111111111, 52.37, 4.90, t),
        vessel(222222222, 52.38, 4.91, t - TimeDelta::seconds(300)),
    ])
    .await
    .unwrap();

    let counts = db.counts().await.unwrap();
    assert_eq!((counts.total, counts.fresh), (2, 1));

    let cutoff = fresh_cutoff(Utc::now());
    assert_eq!(db.delete_stale(cutoff).await.unwrap(), 1);
    assert_eq!(db.delete_stale(cutoff).await.unwrap(), 0);
    assert_eq!(db.counts().await.unwrap().total, 1);
}

#[sqlx::test]
async fn test_large_batch_is_chunked(pool: PgPool) {
    let db = Database::new(pool).await.unwrap();
    let t = now();
    let batch: Vec<VesselState> = (0..2500u32)
        .map(|i| vessel(200_000_000 + i, 50.0 + i as f64 * 0.001, 4.0, t))
        .collect();

    assert_eq!(db.upsert_batch(&batch).await.unwrap(), 2500);
    assert_eq!(db.counts().await.unwrap().total, 2500);
}

#[tokio::test]
async fn test_connect_with_config() {
    dotenvy::dotenv().ok();
    let url = env::var("DATABASE_URL").expect("Environment variable DATABASE_URL required");
    let config = DatabaseConfig {
        url,
        max_connections: 2,
        statement_timeout: Duration::from_secs(5),
        acquire_timeout: Duration::from_secs(5),
    };

    let db = Database::connect(&config).await.unwrap();
    let timeout: String = sqlx::query_scalar("SHOW statement_timeout")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(timeout, "5s");
}
