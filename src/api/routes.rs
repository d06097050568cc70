use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let upload_limit = state.config.uploads.max_upload_size as usize;
    // Multipart framing needs a little room beyond the file itself.
    let multipart_limit = upload_limit.saturating_add(64 * 1024);

    Router::new()
        // Two-phase uploads
        .route("/uploads", post(handlers::init_upload))
        .route("/uploads/:uid/finalize", post(handlers::finalize_upload))
        .route(
            "/uploads/:uid/content",
            put(handlers::upload_content).layer(DefaultBodyLimit::max(upload_limit)),
        )
        // Files
        .route("/files", get(handlers::list_files))
        .route(
            "/files",
            post(handlers::create_file).layer(DefaultBodyLimit::max(multipart_limit)),
        )
        .route("/files/:uid", get(handlers::get_file))
        .route("/files/:uid", put(handlers::update_file))
        .route("/files/:uid", delete(handlers::delete_file))
        .route("/files/:uid/archive", post(handlers::archive_file))
        .route("/files/:uid/restore", post(handlers::restore_file))
        .route("/files/:uid/move", post(handlers::move_file))
        // Variants
        .route("/files/:uid/variants", get(handlers::list_variants))
        .route("/files/:uid/variants", post(handlers::init_variant_upload))
        .route("/files/:uid/variants/derive", post(handlers::derive_variants))
        .route(
            "/files/:uid/variants/:kind/finalize",
            post(handlers::finalize_variant_upload),
        )
        .route(
            "/files/:uid/variants/:kind/content",
            put(handlers::variant_content).layer(DefaultBodyLimit::max(upload_limit)),
        )
        // Links
        .route("/files/:uid/links", get(handlers::list_file_links))
        .route("/files/:uid/links", post(handlers::create_file_link))
        .route("/files/:uid/links", delete(handlers::delete_file_link))
        .route("/links/events", post(handlers::content_event))
        // Content delivery
        .route("/content/:uid", get(handlers::serve_content))
        // Locally signed transfers
        .route("/_storage/:bucket/*key", get(handlers::storage_get))
        .route(
            "/_storage/:bucket/*key",
            put(handlers::storage_put).layer(DefaultBodyLimit::max(upload_limit)),
        )
        // Internal
        .route("/_internal/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
