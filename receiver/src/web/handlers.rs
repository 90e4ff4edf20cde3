//! HTTP endpoint handlers.
//!
//! The submit handler only lifts headers and the untouched body into an
//! [`InboundSubmission`]; every decision is made by the pipeline. The
//! submission endpoints expose the store's list/search/get/cleanup surface
//! as plain JSON, behind a bearer token.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::error::ErrorKind;
use crate::pipeline::{IngestDecision, IngestionPipeline, InboundSubmission};
use crate::store::{ListFilter, StoreStats, Submission, SubmissionPage};

/// Header carrying `rsa-sha256=<signature>`.
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Header carrying the signing time in Unix seconds.
pub const TIMESTAMP_HEADER: &str = "x-timestamp";

/// Header naming the verified email recipient who submitted the form.
pub const SENDER_HEADER: &str = "amp-email-sender";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestionPipeline>,
    admin_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(pipeline: IngestionPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            admin_token: None,
        }
    }

    /// Token required by the submission query endpoints.
    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token.map(Arc::from);
        self
    }
}

// =============================================================================
// Admin authentication
// =============================================================================

/// Check `Authorization: Bearer <token>` against the configured admin token.
///
/// With no token configured every request is refused.
fn authorize_admin(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match (provided, state.admin_token.as_deref()) {
        (Some(provided), Some(expected)) if tokens_match(provided, expected) => Ok(()),
        (None, Some(_)) => {
            warn!("admin_auth_missing");
            Err(StatusCode::UNAUTHORIZED)
        }
        (Some(_), Some(_)) => {
            warn!("admin_auth_invalid");
            Err(StatusCode::UNAUTHORIZED)
        }
        (_, None) => {
            warn!("admin_auth_not_configured");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// Compare digests so neither content nor length leaks through timing.
fn tokens_match(provided: &str, expected: &str) -> bool {
    let provided = Sha256::digest(provided.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    provided.as_slice().ct_eq(expected.as_slice()).into()
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub keys_loaded: usize,
    pub key_generation: u64,
    pub key_refresh_failures: u64,
    pub store: StoreStats,
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let cache = state.pipeline.verifier().cache();
    let snapshot = cache.current_snapshot();

    Json(HealthResponse {
        status: if snapshot.is_empty() { "degraded" } else { "ok" },
        keys_loaded: snapshot.len(),
        key_generation: snapshot.generation(),
        key_refresh_failures: cache.refresh_failures(),
        store: state.pipeline.store().stats(),
    })
}

// =============================================================================
// Submit
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct SubmitQuery {
    #[serde(default)]
    pub form_id: Option<String>,
}

/// HTTP status for a rejection reason.
pub fn status_for(reason: ErrorKind) -> StatusCode {
    match reason {
        ErrorKind::SignatureFormatError
        | ErrorKind::TimestampExpired
        | ErrorKind::SignatureInvalid => StatusCode::UNAUTHORIZED,
        ErrorKind::KeyUnavailable | ErrorKind::KeyFetchError => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::MalformedPayload | ErrorKind::FormNotAllowed => StatusCode::BAD_REQUEST,
        ErrorKind::KeyCodecError
        | ErrorKind::StoreCapacityEviction
        | ErrorKind::PersistenceWriteError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// First hop of `X-Forwarded-For`, else `X-Real-IP`.
fn client_address(headers: &HeaderMap) -> Option<String> {
    header_string(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
        .filter(|v| !v.is_empty())
        .or_else(|| header_string(headers, "x-real-ip"))
}

/// Signed submission endpoint.
pub async fn submit(
    State(state): State<AppState>,
    Query(query): Query<SubmitQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<IngestDecision>) {
    let request = InboundSubmission {
        signature: header_string(&headers, SIGNATURE_HEADER),
        timestamp: header_string(&headers, TIMESTAMP_HEADER),
        sender_identity: header_string(&headers, SENDER_HEADER),
        client_address: client_address(&headers),
        user_agent: header_string(&headers, header::USER_AGENT.as_str()),
        content_type: header_string(&headers, header::CONTENT_TYPE.as_str()),
        form_id: query.form_id.filter(|f| !f.trim().is_empty()),
        body: body.to_vec(),
    };

    info!(
        body_length = request.body.len(),
        has_signature = request.signature.is_some(),
        has_sender = request.sender_identity.is_some(),
        "submission_received"
    );

    let decision = state.pipeline.ingest(request).await;
    let status = match decision.reason {
        None => StatusCode::OK,
        Some(reason) => status_for(reason),
    };

    (status, Json(decision))
}

// =============================================================================
// Submission queries
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub form_id: Option<String>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub validated_only: bool,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub page_size: Option<usize>,
}

pub async fn list_submissions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<SubmissionPage>, StatusCode> {
    authorize_admin(&state, &headers)?;

    let filter = ListFilter {
        form_id: query.form_id,
        from: query.from,
        until: query.until,
        validated_only: query.validated_only,
    };

    Ok(Json(state.pipeline.store().list(
        &filter,
        query.page.unwrap_or(1),
        query.page_size.unwrap_or(0),
    )))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

#[derive(Serialize)]
pub struct SearchResponse {
    pub total: usize,
    pub items: Vec<Submission>,
}

pub async fn search_submissions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchResponse>, StatusCode> {
    authorize_admin(&state, &headers)?;

    let items = state.pipeline.store().search(&query.q);
    Ok(Json(SearchResponse {
        total: items.len(),
        items,
    }))
}

pub async fn get_submission(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Submission>, StatusCode> {
    authorize_admin(&state, &headers)?;

    state
        .pipeline
        .store()
        .get(&id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Deserialize)]
pub struct CleanupQuery {
    pub older_than_days: u32,
}

#[derive(Serialize)]
pub struct CleanupResponse {
    pub removed: usize,
}

pub async fn cleanup_submissions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<CleanupQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    authorize_admin(&state, &headers)?;

    let removed = state.pipeline.store().cleanup(query.older_than_days);
    info!(older_than_days = query.older_than_days, removed = removed, "cleanup_requested");
    Ok(Json(CleanupResponse { removed }))
}
