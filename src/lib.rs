//! Live AIS vessel tracker: stream ingestion, batched conditional writes and
//! bounding-box delta queries.

pub mod api;
pub mod buffer;
pub mod config;
pub mod database;
pub mod errors;
pub mod geohash;
pub mod models;
pub mod query;
pub mod reaper;
pub mod stats;
pub mod stream;
pub mod writer;
