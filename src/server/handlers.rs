use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::postal::{
    validate, BatchReport, CancelToken, LookupError, RawPostalCode, ResolveError, ResolvedLocation,
};

use super::state::AppState;

// ─── Error response ──────────────────────────────────────────────

#[derive(Serialize)]
struct ApiErrorBody {
    error: String,
    code: u16,
}

pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: self.1,
            code: self.0.as_u16(),
        };
        (self.0, Json(body)).into_response()
    }
}

fn api_error(status: StatusCode, msg: impl Into<String>) -> ApiError {
    ApiError(status, msg.into())
}

impl From<LookupError> for ApiError {
    fn from(err: LookupError) -> Self {
        let status = match err {
            LookupError::NotFound | LookupError::InvalidResponse(_) => StatusCode::NOT_FOUND,
            LookupError::Unavailable(_) | LookupError::Throttled { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            LookupError::CredentialRejected(_) => StatusCode::BAD_GATEWAY,
            LookupError::Misconfigured(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        api_error(status, err.to_string())
    }
}

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        let status = match err {
            ResolveError::CredentialRejected { .. } => StatusCode::BAD_GATEWAY,
            ResolveError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            ResolveError::MissingCredential | ResolveError::Client(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        api_error(status, err.to_string())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

// ─── GET /api/health ─────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub cached: usize,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        cached: state.resolver.cache().len(),
    })
}

// ─── GET /api/resolve ────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ResolveQuery {
    pub code: Option<String>,
}

pub async fn resolve(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ResolveQuery>,
) -> Result<Json<ResolvedLocation>, ApiError> {
    let start = Instant::now();

    let raw = params.code.map_or(RawPostalCode::Empty, RawPostalCode::from);
    let code = validate(&raw).map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    let resolver = Arc::clone(&state.resolver);
    let lookup = code.clone();
    let point = tokio::task::spawn_blocking(move || resolver.resolve(&lookup)).await??;

    tracing::info!(
        postal_code = %code,
        elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
        "GET /api/resolve"
    );

    Ok(Json(ResolvedLocation {
        postal_code: code,
        point,
    }))
}

// ─── POST /api/locations ─────────────────────────────────────────

#[derive(Deserialize)]
pub struct LocationsRequest {
    pub codes: Vec<RawPostalCode>,
}

pub async fn locations(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LocationsRequest>,
) -> Result<Json<BatchReport>, ApiError> {
    let start = Instant::now();
    let total = body.codes.len();

    // Dropping this future (client went away) cancels the batch.
    let cancel = CancelToken::new();
    let _guard = cancel.drop_guard();

    let resolver = Arc::clone(&state.resolver);
    let report = tokio::task::spawn_blocking(move || {
        let report = resolver.resolve_batch(&body.codes, &cancel)?;
        if let Err(e) = resolver.cache().persist() {
            tracing::warn!(error = %e, "failed to persist geocode cache");
        }
        Ok::<_, ResolveError>(report)
    })
    .await??;

    tracing::info!(
        total,
        located = report.locations.len(),
        elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
        "POST /api/locations"
    );

    Ok(Json(report))
}
