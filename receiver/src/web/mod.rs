//! Web server module for receiving signed form submissions.
//!
//! This module provides a thin web layer that:
//! - Receives signed submissions and hands them to the ingestion pipeline
//! - Exposes the store's list/search/get/cleanup operations as JSON
//!
//! Verification and storage decisions all live outside this module.

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use handlers::{
    cleanup_submissions, get_submission, health, list_submissions, search_submissions, submit,
    AppState, HealthResponse, SENDER_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/submit", post(submit))
        .route(
            "/submissions",
            get(list_submissions).delete(cleanup_submissions),
        )
        .route("/submissions/search", get(search_submissions))
        .route("/submissions/:id", get(get_submission))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
