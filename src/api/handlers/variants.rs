use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;

use crate::api::actor::CurrentActor;
use crate::api::response::{ApiError, AppJson, JSend};
use crate::service::{BatchOutcome, VariantTicket};
use crate::storage::models::{VariantKind, VariantRecord};
use crate::variants::OutputFormat;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct InitVariantRequest {
    pub kind: VariantKind,
    pub mime_type: String,
    pub size: u64,
}

fn parse_kind(raw: &str) -> Result<VariantKind, ApiError> {
    raw.parse().map_err(ApiError::bad_request)
}

pub async fn list_variants(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(uid): Path<String>,
) -> Result<Json<JSend<Vec<VariantRecord>>>, ApiError> {
    let variants = state.service.list_variants(&actor, &uid).await?;
    Ok(JSend::success(variants))
}

pub async fn init_variant_upload(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(uid): Path<String>,
    AppJson(req): AppJson<InitVariantRequest>,
) -> Result<Json<JSend<VariantTicket>>, ApiError> {
    let ticket = state
        .service
        .variant_upload_init(
            &state.service.context(),
            &actor,
            &uid,
            req.kind,
            &req.mime_type,
            req.size,
        )
        .await?;
    Ok(JSend::success(ticket))
}

pub async fn finalize_variant_upload(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path((uid, kind)): Path<(String, String)>,
) -> Result<Json<JSend<VariantRecord>>, ApiError> {
    let kind = parse_kind(&kind)?;
    let variant = state
        .service
        .variant_upload_finalize(&state.service.context(), &actor, &uid, kind)
        .await?;
    Ok(JSend::success(variant))
}

pub async fn variant_content(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path((uid, kind)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<JSend<VariantRecord>>, ApiError> {
    let kind = parse_kind(&kind)?;
    let variant = state
        .service
        .variant_upload_content(&state.service.context(), &actor, &uid, kind, body)
        .await?;
    Ok(JSend::success(variant))
}

/// Render every variant kind from the stored original. Output formats follow
/// the `Accept` header.
pub async fn derive_variants(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(uid): Path<String>,
    headers: HeaderMap,
) -> Result<Json<JSend<BatchOutcome<VariantKind>>>, ApiError> {
    let formats =
        OutputFormat::negotiate(headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()));
    let outcome = state
        .service
        .derive_variants(&state.service.context(), &actor, &uid, formats)
        .await?;
    Ok(JSend::success(outcome))
}
