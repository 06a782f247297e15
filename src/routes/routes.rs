//! Defines routes for the bucket/object store.
//!
//! ## Structure
//! - **Upload endpoint**
//!   - `POST /upload` — store an object from a multipart form
//!     (`file` binary part, `bucket` and `path` text fields)
//!
//! - **Retrieval endpoints**
//!   - `GET /{bucket}/{*key}` — serve an object; only the first segment
//!     of `key` names the object, later segments are ignored
//!   - `GET /{bucket}` — rejected, a retrieval path needs two segments
//!
//! Wrong-method requests on any matched path answer 405 through the
//! router's method dispatch.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{get_incomplete_path, get_object, upload_object},
    },
    services::storage_service::StorageService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build and return the router for all endpoints.
///
/// The router carries shared state (`StorageService`) to all handlers.
/// `max_upload_bytes` caps the `/upload` request body before multipart
/// parsing reads it.
pub fn routes(max_upload_bytes: usize) -> Router<StorageService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Upload endpoint
        .route(
            "/upload",
            post(upload_object).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        // Retrieval endpoints
        .route("/{bucket}", get(get_incomplete_path))
        .route("/{bucket}/{*key}", get(get_object))
}
