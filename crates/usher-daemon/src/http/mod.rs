//! HTTP surface of the reconciliation daemon.
//!
//! Routes:
//! - `POST /checkins:sync`: batch reconciliation. Requires a bearer
//!   credential the capability checker resolves to an operator identity
//!   (authorization *policy* is an external collaborator; this layer only
//!   verifies the capability). Rate-limited per caller identity; over the
//!   ceiling the whole request gets 429 and the station retries with
//!   backoff.
//! - `GET /guests`: guest record read-back for station cache refresh.
//! - `GET /audit/conflicts`: paginated conflict inspection.
//!
//! Error responses never leak internals; bodies are fixed strings mapped
//! from the error variant.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use usher_core::audit::{AuditRecord, SqliteAuditLog};
use usher_core::checkin::{SyncRequest, SyncResponse};
use usher_core::config::OperatorCredential;
use usher_core::guest::Guest;
use usher_core::ratelimit::RateLimiter;

use crate::registry::SqliteGuestRegistry;
use crate::service::{ReconciliationService, ServiceError};

/// Errors produced by the HTTP layer.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or unrecognized credential.
    #[error("unauthorized")]
    Unauthorized,

    /// Caller exceeded the request-rate ceiling.
    #[error("rate limit exceeded")]
    RateLimited,

    /// The request body or query was malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Internal failure (storage, audit log).
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Fixed bodies: nothing about credentials or storage internals
        // leaves this process.
        let status = self.status_code();
        let body = match &self {
            Self::Unauthorized => "Unauthorized",
            Self::RateLimited => "Rate limit exceeded",
            Self::InvalidRequest(_) => "Invalid request",
            Self::Internal(_) => "Internal server error",
        };
        (status, body).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(value: ServiceError) -> Self {
        Self::Internal(value.to_string())
    }
}

/// A resolved caller identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Operator id recorded as the processing actor.
    pub operator_id: String,
}

/// Capability check performed before any sync call runs.
///
/// Authorization policy lives outside this core; implementations only
/// resolve a presented credential to an identity, or don't.
pub trait CapabilityChecker: Send + Sync {
    /// Resolves a bearer token to a caller identity.
    fn resolve(&self, token: &str) -> Option<CallerIdentity>;
}

/// Token-table capability checker fed from configuration.
pub struct StaticTokenChecker {
    tokens: HashMap<String, String>,
}

impl StaticTokenChecker {
    /// Builds the checker from configured operator credentials.
    #[must_use]
    pub fn new(credentials: &[OperatorCredential]) -> Self {
        Self {
            tokens: credentials
                .iter()
                .map(|c| (c.token.clone(), c.operator_id.clone()))
                .collect(),
        }
    }
}

impl CapabilityChecker for StaticTokenChecker {
    fn resolve(&self, token: &str) -> Option<CallerIdentity> {
        self.tokens.get(token).map(|operator_id| CallerIdentity {
            operator_id: operator_id.clone(),
        })
    }
}

/// Shared state behind the router.
#[derive(Clone)]
pub struct AppState {
    /// The reconciliation service.
    pub service: Arc<ReconciliationService>,
    /// Guest registry, for the read-back route.
    pub registry: Arc<SqliteGuestRegistry>,
    /// Audit log, for the inspection route.
    pub audit: Arc<SqliteAuditLog>,
    /// Per-caller rate limiter.
    pub limiter: Arc<RateLimiter>,
    /// Capability checker.
    pub checker: Arc<dyn CapabilityChecker>,
}

/// Builds the daemon router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/checkins:sync", post(sync_checkins))
        .route("/guests", get(list_guests))
        .route("/audit/conflicts", get(audit_conflicts))
        .with_state(state)
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<CallerIdentity, ApiError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;
    state.checker.resolve(token).ok_or_else(|| {
        warn!("sync call with unrecognized credential");
        ApiError::Unauthorized
    })
}

async fn sync_checkins(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, ApiError> {
    let caller = authorize(&state, &headers)?;
    state
        .limiter
        .check(&caller.operator_id)
        .map_err(|_| ApiError::RateLimited)?;

    let outcome = state.service.apply(&request.checks, &caller.operator_id)?;
    info!(
        caller = %caller.operator_id,
        batch = request.checks.len(),
        applied = outcome.applied_count(),
        failed = outcome.failed().len(),
        "sync batch reconciled"
    );

    Ok(Json(SyncResponse {
        success_count: outcome.success_count(),
        failed: outcome.failed(),
    }))
}

async fn list_guests(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Guest>>, ApiError> {
    authorize(&state, &headers)?;
    let guests = state
        .registry
        .list_guests()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(guests))
}

/// Query parameters for the conflict inspection route.
#[derive(Debug, Deserialize)]
pub struct ConflictQuery {
    /// Sequence id to start from.
    #[serde(default)]
    pub cursor: u64,
    /// Page size.
    #[serde(default = "default_page_limit")]
    pub limit: u64,
}

const fn default_page_limit() -> u64 {
    50
}

/// Maximum page size served by the conflict route.
const MAX_PAGE_LIMIT: u64 = 500;

/// Response body of `GET /audit/conflicts`.
#[derive(Debug, Serialize)]
pub struct ConflictPageBody {
    /// Conflict records, oldest first.
    pub records: Vec<ConflictRecordBody>,
    /// Cursor for the next page, when more records exist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<u64>,
}

/// One conflict record as exposed to the inspection UI.
#[derive(Debug, Serialize)]
pub struct ConflictRecordBody {
    /// Audit sequence id.
    pub seq_id: u64,
    /// Guest email.
    pub guest_email: String,
    /// Reason code (`duplicate`, `older_offline`, `same_timestamp`).
    pub reason: &'static str,
    /// Which side was kept vs. replaced.
    pub resolution: &'static str,
    /// The incoming event's timestamp.
    pub event_at: chrono::DateTime<chrono::Utc>,
    /// The previously authoritative timestamp.
    pub existing_at: chrono::DateTime<chrono::Utc>,
    /// When the conflict was detected.
    pub detected_at: chrono::DateTime<chrono::Utc>,
}

impl ConflictRecordBody {
    fn from_record(record: &AuditRecord) -> Option<Self> {
        let conflict = record.conflict?;
        Some(Self {
            seq_id: record.seq_id?,
            guest_email: record.guest_email.clone(),
            reason: conflict.reason.as_str(),
            resolution: conflict.resolution.as_str(),
            event_at: record.event_at,
            existing_at: conflict.existing_at,
            detected_at: record.recorded_at,
        })
    }
}

async fn audit_conflicts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ConflictQuery>,
) -> Result<Json<ConflictPageBody>, ApiError> {
    authorize(&state, &headers)?;
    if query.limit == 0 || query.limit > MAX_PAGE_LIMIT {
        return Err(ApiError::InvalidRequest(format!(
            "limit must be in 1..={MAX_PAGE_LIMIT}"
        )));
    }

    let page = state
        .audit
        .conflicts(query.cursor, query.limit)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(ConflictPageBody {
        records: page
            .records
            .iter()
            .filter_map(ConflictRecordBody::from_record)
            .collect(),
        next_cursor: page.next_cursor,
    }))
}
