use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::actor::CurrentActor;
use crate::api::response::{ApiError, AppJson, JSend};
use crate::links::{ContentEvent, ReconcileOutcome};
use crate::storage::models::{EntityRef, LinkRecord};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct LinkRequest {
    pub entity_type: String,
    pub entity_uid: String,
    #[serde(default)]
    pub field: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LinkChangeResponse {
    /// False when the request was a no-op.
    pub changed: bool,
}

pub async fn list_file_links(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(uid): Path<String>,
) -> Result<Json<JSend<Vec<LinkRecord>>>, ApiError> {
    let file = state.service.get_file(&actor, &uid).await?;
    let links = state.links.links_for_file(&file.uid).await?;
    Ok(JSend::success(links))
}

pub async fn create_file_link(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(uid): Path<String>,
    AppJson(req): AppJson<LinkRequest>,
) -> Result<Json<JSend<LinkChangeResponse>>, ApiError> {
    let file = state.service.get_file(&actor, &uid).await?;
    let entity = EntityRef::new(req.entity_type, req.entity_uid);
    let changed = state
        .links
        .create_link(&file.uid, &entity, req.field.as_deref())
        .await?;
    Ok(JSend::success(LinkChangeResponse { changed }))
}

pub async fn delete_file_link(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(uid): Path<String>,
    AppJson(req): AppJson<LinkRequest>,
) -> Result<Json<JSend<LinkChangeResponse>>, ApiError> {
    let file = state.service.get_file(&actor, &uid).await?;
    let entity = EntityRef::new(req.entity_type, req.entity_uid);
    let changed = state
        .links
        .delete_link(&file.uid, &entity, req.field.as_deref())
        .await?;
    Ok(JSend::success(LinkChangeResponse { changed }))
}

/// Write hook called by the content-management side after an entity changes.
pub async fn content_event(
    State(state): State<Arc<AppState>>,
    CurrentActor(_actor): CurrentActor,
    AppJson(event): AppJson<ContentEvent>,
) -> Result<Json<JSend<ReconcileOutcome>>, ApiError> {
    if event.entity_type.trim().is_empty() || event.entity_uid.trim().is_empty() {
        return Err(ApiError::bad_request(
            "entity_type and entity_uid must not be empty",
        ));
    }
    let outcome = state.links.handle_event(&event).await?;
    Ok(JSend::success(outcome))
}
