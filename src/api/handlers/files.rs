use axum::extract::multipart::Field;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderMap};
use axum::Json;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;

use crate::api::actor::CurrentActor;
use crate::api::response::{ApiError, AppJson, AppQuery, JSend, JSendPaginated, Pagination};
use crate::object_store::ObjectRef;
use crate::policy::Purpose;
use crate::service::{
    Actor, BatchOutcome, DeleteOutcome, MetadataPatch, MoveRequest, NewUpload, RequestContext,
    ServiceError,
};
use crate::storage::models::{FileFilter, FileRecord, FileType, Patch, VariantKind};
use crate::variants::OutputFormat;
use crate::AppState;

/// Largest page `GET /files` returns.
const MAX_PAGE_LIMIT: u32 = 100;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct FileResponse {
    pub alt_text: Option<String>,
    pub archived_at: Option<String>,
    pub bucket: String,
    pub byte_size: u64,
    pub content_hash: Option<String>,
    pub content_url: String,
    pub created_at: String,
    pub file_type: FileType,
    pub filename: String,
    pub finalized: bool,
    pub height: Option<u32>,
    pub is_public: bool,
    pub mime_type: String,
    pub object_key: String,
    pub owner_id: String,
    pub provider: String,
    pub purpose: Purpose,
    pub tags: Vec<String>,
    pub title: Option<String>,
    pub uid: String,
    pub updated_at: String,
    pub width: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct CreateFileResponse {
    pub file: FileResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variants: Option<BatchOutcome<VariantKind>>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct UpdateFileRequest {
    #[serde(default, deserialize_with = "nullable")]
    pub alt_text: Option<Option<String>>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub is_public: Option<bool>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub title: Option<Option<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteFileParams {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct MoveFileResponse {
    pub file: FileResponse,
    pub cleanup: BatchOutcome<ObjectRef>,
}

/// Distinguishes between a missing field (`None`) and an explicit `null` (`Some(None)`).
fn nullable<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: DeserializeOwned,
    D: Deserializer<'de>,
{
    Ok(Some(Option::deserialize(deserializer)?))
}

// ============================================================================
// Handlers
// ============================================================================

/// Proxied multipart upload. With `variants=true` image variants are rendered
/// from the uploaded body in the same request.
pub async fn create_file(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<JSend<CreateFileResponse>>, ApiError> {
    let mut file_data: Option<Bytes> = None;
    let mut file_name: Option<String> = None;
    let mut file_content_type: Option<String> = None;
    let mut purpose: Option<String> = None;
    let mut folder = String::new();
    let mut bucket: Option<String> = None;
    let mut is_public = false;
    let mut title: Option<String> = None;
    let mut alt_text: Option<String> = None;
    let mut tags: Vec<String> = Vec::new();
    let mut derive = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart data: {e}")))?
    {
        let field_name = field.name().unwrap_or("").to_string();

        match field_name.as_str() {
            "file" => {
                file_name = field.file_name().map(|s| s.to_string());
                file_content_type = field.content_type().map(|s| s.to_string());
                file_data = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::bad_request(format!("Failed to read file: {e}")))?,
                );
            }
            "purpose" => purpose = Some(text(field, "purpose").await?),
            "folder" => folder = text(field, "folder").await?,
            "bucket" => bucket = Some(text(field, "bucket").await?),
            "is_public" => is_public = flag(&text(field, "is_public").await?),
            "title" => title = Some(text(field, "title").await?),
            "alt_text" => alt_text = Some(text(field, "alt_text").await?),
            "tags" => {
                tags = text(field, "tags")
                    .await?
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "variants" => derive = flag(&text(field, "variants").await?),
            _ => {
                // Ignore unknown fields
            }
        }
    }

    let file_data = file_data.ok_or_else(|| ApiError::bad_request("file field is required"))?;
    let file_name = file_name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("file field must carry a filename"))?;
    let purpose: Purpose = purpose
        .as_deref()
        .unwrap_or("general")
        .parse()
        .map_err(ServiceError::from)?;

    let mut upload = NewUpload::new(purpose, file_name, file_data.len() as u64);
    upload.mime_type = file_content_type;
    upload.folder = folder;
    upload.bucket = bucket;
    upload.is_public = is_public;
    upload.title = title;
    upload.alt_text = alt_text;
    upload.tags = tags;

    let ctx = state.service.context();
    let file = state
        .service
        .upload_proxied(&ctx, &actor, upload, file_data.clone())
        .await?;

    let variants = if derive && file.file_type() == FileType::Image {
        let formats = OutputFormat::negotiate(
            headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()),
        );
        Some(derive_uploaded(&state, &ctx, &actor, &file, file_data, formats).await)
    } else {
        None
    };

    Ok(JSend::success(CreateFileResponse {
        file: file_to_response(&file),
        variants,
    }))
}

pub async fn get_file(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(uid): Path<String>,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let file = state.service.get_file(&actor, &uid).await?;
    Ok(JSend::success(file_to_response(&file)))
}

pub async fn update_file(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(uid): Path<String>,
    AppJson(req): AppJson<UpdateFileRequest>,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    // Validate at least one field is provided
    if req.alt_text.is_none()
        && req.filename.is_none()
        && req.is_public.is_none()
        && req.tags.is_none()
        && req.title.is_none()
    {
        return Err(ApiError::bad_request(
            "at least one field (alt_text, filename, is_public, tags, title) must be provided",
        ));
    }

    let patch = MetadataPatch {
        filename: req.filename,
        title: Patch::from(req.title),
        alt_text: Patch::from(req.alt_text),
        tags: req.tags,
        is_public: req.is_public,
    };
    let file = state.service.update_metadata(&actor, &uid, patch).await?;

    Ok(JSend::success(file_to_response(&file)))
}

pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(uid): Path<String>,
    AppQuery(params): AppQuery<DeleteFileParams>,
) -> Result<Json<JSend<DeleteOutcome>>, ApiError> {
    let outcome = state
        .service
        .delete_file(&state.service.context(), &actor, &uid, params.force)
        .await?;
    Ok(JSend::success(outcome))
}

pub async fn archive_file(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(uid): Path<String>,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let file = state.service.archive(&actor, &uid).await?;
    Ok(JSend::success(file_to_response(&file)))
}

pub async fn restore_file(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(uid): Path<String>,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let file = state.service.restore(&actor, &uid).await?;
    Ok(JSend::success(file_to_response(&file)))
}

pub async fn move_file(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(uid): Path<String>,
    AppJson(req): AppJson<MoveRequest>,
) -> Result<Json<JSend<MoveFileResponse>>, ApiError> {
    let outcome = state
        .service
        .move_file(&state.service.context(), &actor, &uid, req)
        .await?;
    Ok(JSend::success(MoveFileResponse {
        file: file_to_response(&outcome.file),
        cleanup: outcome.cleanup,
    }))
}

pub async fn list_files(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    AppQuery(mut filter): AppQuery<FileFilter>,
) -> Result<Json<JSendPaginated<FileResponse>>, ApiError> {
    if filter.limit == 0 {
        return Err(ApiError::bad_request("limit must be greater than 0"));
    }
    filter.limit = filter.limit.min(MAX_PAGE_LIMIT);

    let (limit, offset) = (filter.limit, filter.offset);
    let page = state.service.list_files(&actor, filter).await?;

    Ok(JSendPaginated::success(
        page.items.iter().map(file_to_response).collect(),
        Pagination {
            limit,
            offset,
            total: page.total,
        },
    ))
}

// ============================================================================
// Helpers
// ============================================================================

async fn text(field: Field<'_>, name: &str) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid {name}: {e}")))
}

/// The upload is already stored, so a rendering failure is reported per kind
/// instead of failing the request.
async fn derive_uploaded(
    state: &AppState,
    ctx: &RequestContext,
    actor: &Actor,
    file: &FileRecord,
    data: Bytes,
    formats: Vec<OutputFormat>,
) -> BatchOutcome<VariantKind> {
    match state
        .service
        .derive_variants_from(ctx, actor, &file.uid, data, formats)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::warn!(file_uid = %file.uid, error = %e, "Variant derivation failed after upload");
            let mut outcome = BatchOutcome::new();
            for kind in VariantKind::ALL {
                outcome.fail(kind, &e);
            }
            outcome
        }
    }
}

fn flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "on")
}

pub(super) fn file_to_response(file: &FileRecord) -> FileResponse {
    FileResponse {
        alt_text: file.alt_text.clone(),
        archived_at: file.archived_at.map(|t| t.to_rfc3339()),
        bucket: file.bucket.clone(),
        byte_size: file.byte_size,
        content_hash: file.content_hash.clone(),
        content_url: format!("/content/{}", file.uid),
        created_at: file.created_at.to_rfc3339(),
        file_type: file.file_type(),
        filename: file.filename.clone(),
        finalized: file.is_finalized(),
        height: file.height,
        is_public: file.is_public,
        mime_type: file.mime_type.clone(),
        object_key: file.object_key.clone(),
        owner_id: file.owner_id.clone(),
        provider: file.provider.clone(),
        purpose: file.purpose,
        tags: file.tags.clone(),
        title: file.title.clone(),
        uid: file.uid.clone(),
        updated_at: file.updated_at.to_rfc3339(),
        width: file.width,
    }
}
