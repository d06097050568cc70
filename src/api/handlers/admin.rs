use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::api::response::JSend;
use crate::object_store::Capabilities;
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub storage: StorageInfo,
}

#[derive(Debug, Serialize)]
pub struct StorageInfo {
    pub provider: String,
    pub capabilities: Capabilities,
    pub cached_redirects: usize,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn health(State(state): State<Arc<AppState>>) -> Json<JSend<HealthResponse>> {
    let store = state.service.store();
    JSend::success(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        storage: StorageInfo {
            provider: store.provider().to_string(),
            capabilities: store.capabilities(),
            cached_redirects: state.service.cache().len(),
        },
    })
}
