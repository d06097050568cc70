use axum::extract::{Path, State};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;

use super::files::{file_to_response, FileResponse};
use crate::api::actor::CurrentActor;
use crate::api::response::{ApiError, AppJson, JSend};
use crate::object_store::ObjectRef;
use crate::policy::Purpose;
use crate::service::{NewUpload, ServiceError, UploadTicket};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct InitUploadRequest {
    /// Parsed by the service so unknown purposes report `invalid_purpose`.
    pub purpose: String,
    pub filename: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub size: u64,
    #[serde(default)]
    pub folder: String,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub alt_text: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FinalizeUploadRequest {
    /// Object the client uploaded to; must match the one issued at init.
    #[serde(default)]
    pub object: Option<ObjectRef>,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn init_upload(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    AppJson(req): AppJson<InitUploadRequest>,
) -> Result<Json<JSend<UploadTicket>>, ApiError> {
    let purpose: Purpose = req.purpose.parse().map_err(ServiceError::from)?;

    let mut upload = NewUpload::new(purpose, req.filename, req.size);
    upload.mime_type = req.mime_type;
    upload.folder = req.folder;
    upload.bucket = req.bucket;
    upload.is_public = req.is_public;
    upload.title = req.title;
    upload.alt_text = req.alt_text;
    upload.tags = req.tags;

    let ticket = state
        .service
        .upload_init(&state.service.context(), &actor, upload)
        .await?;
    Ok(JSend::success(ticket))
}

/// The body is optional; an empty body finalizes without a location check.
pub async fn finalize_upload(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(uid): Path<String>,
    body: Bytes,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let req: FinalizeUploadRequest = if body.iter().all(u8::is_ascii_whitespace) {
        FinalizeUploadRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("Invalid request body: {e}")))?
    };

    let file = state
        .service
        .upload_finalize(&state.service.context(), &actor, &uid, req.object.as_ref())
        .await?;
    Ok(JSend::success(file_to_response(&file)))
}

/// Proxied transfer for an upload initialised without a presigned URL.
pub async fn upload_content(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(uid): Path<String>,
    body: Bytes,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let file = state
        .service
        .upload_content(&state.service.context(), &actor, &uid, body)
        .await?;
    Ok(JSend::success(file_to_response(&file)))
}
