//! Read API over the catalog and cache
//!
//! Cache-backed reads never wait on the replica: a missing entry answers
//! `202 Accepted` with `Retry-After` while it is built in the background.
//! Refresh triggers answer at once with `202` or `409`.

mod error;

pub use error::ApiError;

use crate::cache::{CacheKey, CacheLayer, CacheRead};
use crate::catalog::{competition_summaries, CatalogStore, Competition};
use crate::db::RunRepository;
use crate::refresh::{RefreshMode, RefreshOrchestrator};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use sdk::errors::EngineError;
use sdk::types::Campaign;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

const DEFAULT_RUNS_LIMIT: i64 = 20;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<dyn CatalogStore>,
    pub cache: CacheLayer,
    pub orchestrator: Arc<RefreshOrchestrator>,
    pub runs: Option<RunRepository>,
    pub retry_after_secs: u64,
    pub started_at: Instant,
}

impl AppState {
    fn campaign(&self, id: &str) -> Result<&Campaign, ApiError> {
        self.orchestrator
            .campaigns()
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| EngineError::CampaignNotFound(id.to_string()).into())
    }
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/campaigns", get(campaigns))
        .route("/api/data", get(data))
        .route("/api/data/:campaign", get(campaign_data))
        .route("/api/data/:campaign/:year", get(year_data))
        .route("/api/country/:campaign/:year/:country", get(country_detail))
        .route("/api/uploaders/:campaign/:year/:country", get(uploaders))
        .route("/api/refresh/full", post(refresh_full))
        .route("/api/refresh/incremental", post(refresh_incremental))
        .route("/api/prebuild", post(prebuild))
        .route("/api/runs", get(runs))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "refresh": state.orchestrator.status(),
        "cache": state.cache.stats(),
    }))
}

async fn campaigns(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.campaigns().to_vec())
}

async fn data(State(state): State<AppState>) -> Result<Response, ApiError> {
    let catalog = state.catalog.load().await?;
    Ok(Json(competition_summaries(&catalog)).into_response())
}

async fn campaign_data(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let campaign = state.campaign(&id)?;
    let catalog = state.catalog.load().await?;
    let competition = catalog
        .find(&campaign.id)
        .cloned()
        .unwrap_or_else(|| Competition::new(campaign, Vec::new()));
    Ok(Json(competition).into_response())
}

async fn year_data(
    State(state): State<AppState>,
    Path((id, year)): Path<(String, i32)>,
) -> Result<Response, ApiError> {
    let campaign = state.campaign(&id)?;
    let catalog = state.catalog.load().await?;
    match catalog.year(&campaign.id, year) {
        Some(record) => Ok(Json(record).into_response()),
        None => Err(ApiError::NotFound(format!(
            "No data for {} {}",
            campaign.id, year
        ))),
    }
}

fn cache_response(state: &AppState, read: CacheRead) -> Response {
    match read {
        CacheRead::Pending => (
            StatusCode::ACCEPTED,
            [(header::RETRY_AFTER, state.retry_after_secs.to_string())],
            Json(json!({
                "status": "pending",
                "retry_after": state.retry_after_secs,
            })),
        )
            .into_response(),
        read => {
            let status = read.status().to_string();
            let data = read.entry().map(|e| e.payload.clone());
            Json(json!({ "status": status, "data": data })).into_response()
        }
    }
}

async fn country_detail(
    State(state): State<AppState>,
    Path((id, year, country)): Path<(String, i32, String)>,
) -> Result<Response, ApiError> {
    let campaign = state.campaign(&id)?;
    let read = state
        .cache
        .get(&CacheKey::country_detail(&campaign.id, year, country));
    Ok(cache_response(&state, read))
}

async fn uploaders(
    State(state): State<AppState>,
    Path((id, year, country)): Path<(String, i32, String)>,
) -> Result<Response, ApiError> {
    let campaign = state.campaign(&id)?;
    let read = state
        .cache
        .get(&CacheKey::uploaders(&campaign.id, year, country));
    Ok(cache_response(&state, read))
}

fn trigger(state: &AppState, mode: RefreshMode) -> Result<Response, ApiError> {
    let accepted = state.orchestrator.trigger(mode)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "mode": accepted.mode,
            "run_id": accepted.run_id,
        })),
    )
        .into_response())
}

async fn refresh_full(State(state): State<AppState>) -> Result<Response, ApiError> {
    trigger(&state, RefreshMode::Full)
}

async fn refresh_incremental(State(state): State<AppState>) -> Result<Response, ApiError> {
    trigger(&state, RefreshMode::Incremental)
}

async fn prebuild(State(state): State<AppState>) -> impl IntoResponse {
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = orchestrator.prebuild().await {
            warn!("Prebuild failed: {}", e);
        }
    });
    (StatusCode::ACCEPTED, Json(json!({ "status": "accepted" })))
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    limit: Option<i64>,
}

async fn runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Result<Response, ApiError> {
    let Some(repo) = &state.runs else {
        return Ok(Json(json!([])).into_response());
    };
    let limit = query.limit.unwrap_or(DEFAULT_RUNS_LIMIT).clamp(1, 500);
    let runs = repo
        .recent_runs(limit)
        .await
        .map_err(|e| ApiError::Internal(format!("{:#}", e)))?;
    Ok(Json(runs).into_response())
}
