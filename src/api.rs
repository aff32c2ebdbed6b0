//! HTTP API
//!
//! - `GET /api/vessels?bbox=minLon,minLat,maxLon,maxLat&zoom=Z[&lastUpdateTime=ISO8601]`
//! - `GET /health`
//! - `GET /`

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::{
    database::VesselStore,
    errors::{AppError, QueryError},
    models::BoundingBox,
    query::{QueryService, VesselsResponse},
    stream::IngestState,
};

#[derive(Clone)]
pub struct AppState {
    pub query: QueryService,
    pub store: Arc<dyn VesselStore>,
    pub ingest: watch::Receiver<IngestState>,
}

impl AppState {
    pub fn new(store: Arc<dyn VesselStore>, ingest: watch::Receiver<IngestState>) -> Self {
        Self {
            query: QueryService::new(store.clone()),
            store,
            ingest,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/vessels", get(vessels))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve `router` on `bind` until `shutdown` flips to `true`.
pub async fn serve(
    router: Router,
    bind: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), AppError> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("HTTP API listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow_and_update() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    info!("HTTP API stopped");
    Ok(())
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            QueryError::InvalidQuery(message) => (StatusCode::BAD_REQUEST, message.clone()),
            QueryError::Store(e) => {
                error!("Vessel query failed: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "vessel store unavailable".to_string(),
                )
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct VesselsParams {
    bbox: Option<String>,
    zoom: Option<String>,
    #[serde(rename = "lastUpdateTime", alias = "since")]
    last_update_time: Option<String>,
}

async fn vessels(
    State(state): State<AppState>,
    Query(params): Query<VesselsParams>,
) -> Result<Json<VesselsResponse>, QueryError> {
    let bbox: BoundingBox = params
        .bbox
        .as_deref()
        .ok_or_else(|| QueryError::InvalidQuery("missing bbox parameter".to_string()))?
        .parse()?;
    let zoom = parse_zoom(params.zoom.as_deref())?;
    let since = params.last_update_time.as_deref().and_then(|raw| {
        let parsed = parse_cursor(raw);
        if parsed.is_none() {
            warn!("Ignoring unparseable lastUpdateTime {:?}, returning full snapshot", raw);
        }
        parsed
    });

    let response = state.query.query(bbox, zoom, since).await?;
    Ok(Json(response))
}

fn parse_zoom(raw: Option<&str>) -> Result<u8, QueryError> {
    let raw = raw.ok_or_else(|| QueryError::InvalidQuery("missing zoom parameter".to_string()))?;
    raw.trim()
        .parse::<u8>()
        .map_err(|_| QueryError::InvalidQuery(format!("invalid zoom: {}", raw)))
}

/// ISO 8601 cursor; a value without offset is taken as UTC.
fn parse_cursor(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|t| t.and_utc())
        })
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
    database: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    vessels_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fresh_count: Option<i64>,
    ingest_state: IngestState,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let ingest_state = *state.ingest.borrow();
    match state.store.counts().await {
        Ok(counts) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "healthy",
                timestamp: Utc::now(),
                database: "connected",
                vessels_count: Some(counts.total),
                fresh_count: Some(counts.fresh),
                ingest_state,
                error: None,
            }),
        ),
        Err(e) => {
            warn!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unhealthy",
                    timestamp: Utc::now(),
                    database: "unavailable",
                    vessels_count: None,
                    fresh_count: None,
                    ingest_state,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

async fn index() -> Json<serde_json::Value> {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "vessels": "/api/vessels?bbox=minLon,minLat,maxLon,maxLat&zoom=Z[&lastUpdateTime=ISO8601]",
            "health": "/health",
        },
    }))
}
