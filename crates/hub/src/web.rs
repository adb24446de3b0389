use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post, put};
use axum::Router;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

use crate::db::WateringEvent;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::model::{ScheduleEntry, Settings, SettingsPatch, Zone, ZonePatch, ZoneSpec};
use crate::state::StatusResponse;
use crate::tasks;

const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    /// How long a manually triggered run stays active.
    pub active_delay: Duration,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/zones", get(list_zones).post(upsert_zone))
        .route(
            "/api/zones/{id}",
            get(get_zone).patch(update_zone).delete(delete_zone),
        )
        .route("/api/zones/{id}/active", put(set_zone_active))
        .route("/api/zones/{id}/water", post(water_zone))
        .route("/api/schedules", get(list_schedules))
        .route("/api/schedules/generate", post(generate_schedules))
        .route("/api/schedules/{id}/cancel", post(cancel_schedule))
        .route("/api/settings", get(get_settings).patch(update_settings))
        .route("/api/history", get(history))
        .with_state(state)
}

/// Malformed bodies get the same error envelope as engine validation.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> EngineResult<T> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| EngineError::Validation(e.body_text()))
}

async fn api_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(state.engine.status().await)
}

// ── Zones ───────────────────────────────────────────────────────────

async fn list_zones(State(state): State<AppState>) -> Json<Vec<Zone>> {
    Json(state.engine.list_zones().await)
}

async fn upsert_zone(
    State(state): State<AppState>,
    payload: Result<Json<ZoneSpec>, JsonRejection>,
) -> EngineResult<Json<Zone>> {
    let spec = body(payload)?;
    Ok(Json(state.engine.upsert_zone(spec).await?))
}

async fn get_zone(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> EngineResult<Json<Zone>> {
    Ok(Json(state.engine.get_zone(&id).await?))
}

async fn update_zone(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ZonePatch>, JsonRejection>,
) -> EngineResult<Json<Zone>> {
    let patch = body(payload)?;
    Ok(Json(state.engine.update_zone(&id, patch).await?))
}

async fn delete_zone(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> EngineResult<Json<Zone>> {
    Ok(Json(state.engine.delete_zone(&id).await?))
}

#[derive(Deserialize)]
struct ActiveBody {
    active: bool,
}

async fn set_zone_active(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ActiveBody>, JsonRejection>,
) -> EngineResult<Json<Zone>> {
    let ActiveBody { active } = body(payload)?;
    Ok(Json(state.engine.set_zone_active(&id, active).await?))
}

async fn water_zone(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> EngineResult<impl IntoResponse> {
    let entry = state.engine.trigger_manual_water(&id).await?;
    tasks::finish_after(
        Arc::clone(&state.engine),
        entry.id.clone(),
        state.active_delay,
    );
    Ok((StatusCode::ACCEPTED, Json(entry)))
}

// ── Schedules ───────────────────────────────────────────────────────

async fn list_schedules(State(state): State<AppState>) -> Json<Vec<ScheduleEntry>> {
    Json(state.engine.list_schedules().await)
}

async fn generate_schedules(State(state): State<AppState>) -> Json<Vec<ScheduleEntry>> {
    Json(state.engine.generate_schedule_now().await)
}

async fn cancel_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> EngineResult<Json<ScheduleEntry>> {
    Ok(Json(state.engine.cancel_schedule(&id).await?))
}

// ── Settings & history ──────────────────────────────────────────────

async fn get_settings(State(state): State<AppState>) -> Json<Settings> {
    Json(state.engine.settings().await.as_ref().clone())
}

async fn update_settings(
    State(state): State<AppState>,
    payload: Result<Json<SettingsPatch>, JsonRejection>,
) -> EngineResult<Json<Settings>> {
    let patch = body(payload)?;
    Ok(Json(state.engine.update_settings(patch).await?))
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
}

async fn history(
    State(state): State<AppState>,
    Query(q): Query<HistoryQuery>,
) -> EngineResult<Json<Vec<WateringEvent>>> {
    let limit = q
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    Ok(Json(state.engine.history(limit).await?))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
