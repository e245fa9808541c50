//! JSON API. Every `/api` route runs under the caller's session and only
//! ever sees the session's organization.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{header::AUTHORIZATION, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, instrument};

use crate::db::{self, Pool, Session, SqliteListingStore};
use crate::gbp::ListingSource;
use crate::model::{ListingStatus, SELECTED_FOR_ANALYTICS};
use crate::reconcile::ReconcileOptions;
use crate::sync::{run_sync, SyncContext, SyncError, SyncLocks};

const SYNC_RUN_HISTORY: i64 = 20;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub source: Arc<dyn ListingSource>,
    pub locks: SyncLocks,
    pub options: ReconcileOptions,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/listings", get(list_listings))
        .route("/api/listings/sync", post(sync_listings))
        .route("/api/listings/sync-runs", get(list_sync_runs))
        .route("/api/listings/{id}/status", patch(update_status))
        .route("/api/listings/{id}/analytics", patch(update_analytics_selection))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request body: {0}")]
    InvalidBody(#[from] JsonRejection),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, details) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "Unauthorized",
                "missing, unknown or expired session".to_string(),
            ),
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, "Not found", what),
            ApiError::InvalidBody(rejection) => (
                rejection.status(),
                "Invalid request body",
                rejection.body_text(),
            ),
            ApiError::Sync(SyncError::UpstreamUnavailable { reason }) => (
                StatusCode::BAD_GATEWAY,
                "Failed to connect to Google Business Profile",
                reason,
            ),
            ApiError::Sync(SyncError::Internal(err)) | ApiError::Internal(err) => {
                error!(?err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error",
                    "the request could not be completed".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": error, "details": details }))).into_response()
    }
}

/// `Json` whose rejections come back in the same `{ error, details }` shape.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

/// Caller's session, resolved from `Authorization: Bearer <token>`.
pub struct CurrentSession(pub Session);

impl FromRequestParts<AppState> for CurrentSession {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.trim().split_once(' '))
            .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
            .map(|(_, token)| token.trim())
            .filter(|t| !t.is_empty())
            .ok_or(ApiError::Unauthorized)?;

        match db::find_active_session(&state.pool, token, Utc::now()).await? {
            Some(session) => Ok(CurrentSession(session)),
            None => {
                debug!("rejected unknown or expired session");
                Err(ApiError::Unauthorized)
            }
        }
    }
}

async fn health() -> &'static str {
    "ok"
}

#[instrument(skip_all)]
async fn sync_listings(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
) -> Result<impl IntoResponse, ApiError> {
    let org = db::find_organization(&state.pool, &session.organization_id)
        .await?
        .ok_or(ApiError::Unauthorized)?;

    let store = SqliteListingStore::new(state.pool.clone());
    let ctx = SyncContext {
        store: &store,
        source: state.source.as_ref(),
        locks: &state.locks,
        options: state.options,
    };
    let report = run_sync(&ctx, &org.id, org.gbp_refresh_token.as_deref()).await?;
    Ok(Json(report))
}

async fn list_listings(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
) -> Result<impl IntoResponse, ApiError> {
    let listings = db::list_listings(&state.pool, &session.organization_id).await?;
    Ok(Json(listings))
}

async fn list_sync_runs(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
) -> Result<impl IntoResponse, ApiError> {
    let runs =
        db::recent_sync_runs(&state.pool, &session.organization_id, SYNC_RUN_HISTORY).await?;
    Ok(Json(runs))
}

#[derive(Debug, Deserialize)]
pub struct StatusBody {
    pub status: ListingStatus,
}

async fn update_status(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<StatusBody>,
) -> Result<impl IntoResponse, ApiError> {
    let listing = db::set_listing_status(&state.pool, &session.organization_id, &id, body.status)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("listing {id}")))?;
    Ok(Json(listing))
}

#[derive(Debug, Deserialize)]
pub struct AnalyticsSelectionBody {
    pub selected: bool,
}

async fn update_analytics_selection(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<AnalyticsSelectionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let listing = db::set_listing_attribute(
        &state.pool,
        &session.organization_id,
        &id,
        SELECTED_FOR_ANALYTICS,
        Value::Bool(body.selected),
    )
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("listing {id}")))?;
    Ok(Json(listing))
}
