use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::path::Path as FsPath;
use std::sync::Arc;
use tokio_util::io::ReaderStream;

use crate::api::actor::MaybeActor;
use crate::api::response::{ApiError, AppQuery};
use crate::service::{ContentAccess, ContentRequest};
use crate::AppState;

/// Serve a file or one of its variants.
/// Route: GET /content/:uid?variant=&w=&download=
///
/// Redirect-capable backends answer with a 302 to a signed or public URL;
/// the local backend streams the file from disk.
pub async fn serve_content(
    State(state): State<Arc<AppState>>,
    MaybeActor(actor): MaybeActor,
    Path(uid): Path<String>,
    AppQuery(req): AppQuery<ContentRequest>,
) -> Result<Response, ApiError> {
    let access = state
        .service
        .resolve_content_access(&state.service.context(), actor.as_ref(), &uid, &req)
        .await?;

    match access {
        ContentAccess::Redirect { url, .. } => {
            let location = HeaderValue::from_str(&url)
                .map_err(|e| ApiError::internal(format!("Invalid redirect URL: {e}")))?;
            let mut response = StatusCode::FOUND.into_response();
            let headers = response.headers_mut();
            headers.insert(header::LOCATION, location);
            headers.insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static("private, no-store"),
            );
            Ok(response)
        }
        ContentAccess::Local {
            path,
            content_type,
            byte_size,
            disposition,
        } => stream_file(&path, &content_type, &disposition, Some(byte_size)).await,
    }
}

/// Stream a file from disk without buffering it.
pub(super) async fn stream_file(
    path: &FsPath,
    content_type: &str,
    disposition: &str,
    byte_size: Option<u64>,
) -> Result<Response, ApiError> {
    let file = tokio::fs::File::open(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ApiError::not_found("File content not found")
        } else {
            ApiError::internal(format!("Failed to open file: {e}"))
        }
    })?;
    let byte_size = match byte_size {
        Some(size) => size,
        None => file
            .metadata()
            .await
            .map_err(|e| ApiError::internal(format!("Failed to stat file: {e}")))?
            .len(),
    };

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();

    headers.insert(
        header::CONTENT_TYPE,
        content_type
            .parse()
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(byte_size));
    if let Ok(value) = disposition.parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );

    Ok(response)
}
