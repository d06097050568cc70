use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use bytes::Bytes;
use std::sync::Arc;

use super::content::stream_file;
use crate::api::response::{ApiError, AppQuery, JSend};
use crate::object_store::{LocalStore, ObjectRef, ObjectStore, ObjectStoreError, SignedQuery};
use crate::AppState;

fn storage_error(e: ObjectStoreError) -> ApiError {
    match e {
        ObjectStoreError::InvalidSignature => ApiError::forbidden(e.to_string()),
        ObjectStoreError::NotFound(_) => ApiError::not_found(e.to_string()),
        ObjectStoreError::InvalidKey(_) => ApiError::bad_request(e.to_string()),
        ObjectStoreError::Unsupported(_) => ApiError::not_found("Signed transfers are disabled"),
        _ => ApiError::internal(format!("Storage failure: {e}")),
    }
}

fn local_store(state: &AppState) -> Result<&Arc<LocalStore>, ApiError> {
    state
        .local_store
        .as_ref()
        .ok_or_else(|| ApiError::not_found("Signed transfers are not served by this backend"))
}

/// Receive a presigned upload for the local backend.
/// Route: PUT /_storage/:bucket/*key
pub async fn storage_put(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    AppQuery(query): AppQuery<SignedQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<JSend<()>>), ApiError> {
    let store = local_store(&state)?;
    let obj = ObjectRef::new(bucket, key);
    store.verify("PUT", &obj, &query).map_err(storage_error)?;

    let content_type = query.ct.as_deref().unwrap_or("application/octet-stream");
    store
        .put(&obj, body, content_type)
        .await
        .map_err(storage_error)?;

    tracing::debug!(object = %obj, "Stored signed upload");
    Ok((StatusCode::CREATED, JSend::success(())))
}

/// Serve a presigned download for the local backend.
/// Route: GET /_storage/:bucket/*key
pub async fn storage_get(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    AppQuery(query): AppQuery<SignedQuery>,
) -> Result<Response, ApiError> {
    let store = local_store(&state)?;
    let obj = ObjectRef::new(bucket, key);
    store.verify("GET", &obj, &query).map_err(storage_error)?;

    let path = store.local_path(&obj).map_err(storage_error)?;
    stream_file(
        &path,
        query.ct.as_deref().unwrap_or("application/octet-stream"),
        query.cd.as_deref().unwrap_or("attachment"),
        None,
    )
    .await
}
