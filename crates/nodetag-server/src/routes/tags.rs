use axum::extract::{Path, State};
use axum::Json;
use nodetag_core::tag::{Tag, TagChanges};
use nodetag_core::{rebuild, TagError, TagStore};
use std::sync::Arc;

use crate::error::AppError;
use crate::state::AppState;

fn tag_json(tag: &Tag, node_count: usize) -> serde_json::Value {
    serde_json::json!({
        "name": tag.name,
        "definition": tag.definition,
        "comment": tag.comment,
        "kernel_opts": tag.kernel_opts,
        "manual": tag.is_manual(),
        "node_count": node_count,
        "created_at": tag.created_at,
        "updated_at": tag.updated_at,
    })
}

/// Kick off a per-tag rebuild in the background. Used after a create or
/// definition change; the HTTP caller gets its response immediately and the
/// member set converges behind it.
fn spawn_tag_rebuild(store: Arc<TagStore>, name: String) {
    tokio::spawn(async move {
        let result = tokio::task::spawn_blocking(move || {
            rebuild::rebuild_tag(&store, store.matcher(), &name)
        })
        .await;
        match result {
            Ok(Ok(outcome)) => tracing::info!(
                tag = %outcome.tag,
                added = outcome.added,
                removed = outcome.removed,
                failures = outcome.failures.len(),
                "tag rebuild finished"
            ),
            Ok(Err(e)) => tracing::warn!("tag rebuild failed: {e}"),
            Err(e) => tracing::warn!("tag rebuild task panicked: {e}"),
        }
    });
}

/// GET /api/tags — list all tags with member counts.
pub async fn list_tags(
    State(app): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let store = app.store.clone();
    let result = tokio::task::spawn_blocking(move || {
        let tags = store.list_tags()?;
        let mut list = Vec::with_capacity(tags.len());
        for tag in &tags {
            let count = store.nodes_for(&tag.name).map(|n| n.len()).unwrap_or(0);
            list.push(tag_json(tag, count));
        }
        Ok::<_, TagError>(serde_json::json!(list))
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    Ok(Json(result))
}

#[derive(serde::Deserialize)]
pub struct CreateTagBody {
    pub name: String,
    #[serde(default)]
    pub definition: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub kernel_opts: Option<String>,
}

/// POST /api/tags — create a tag. A definition-bearing tag is populated by
/// a background rebuild right after creation.
pub async fn create_tag(
    State(app): State<AppState>,
    Json(body): Json<CreateTagBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let store = app.store.clone();
    let tag = tokio::task::spawn_blocking(move || {
        store.create_tag(
            &body.name,
            &body.definition,
            body.comment,
            body.kernel_opts,
        )
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    if !tag.is_manual() {
        spawn_tag_rebuild(app.store.clone(), tag.name.clone());
    }

    Ok(Json(tag_json(&tag, 0)))
}

/// GET /api/tags/{name} — tag detail including its member system_ids.
pub async fn get_tag(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let store = app.store.clone();
    let result = tokio::task::spawn_blocking(move || {
        let tag = store.get_tag(&name)?;
        let nodes = store.nodes_for(&name)?;
        let mut detail = tag_json(&tag, nodes.len());
        detail["nodes"] = serde_json::json!(nodes);
        Ok::<_, TagError>(detail)
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    Ok(Json(result))
}

#[derive(serde::Deserialize)]
pub struct UpdateTagBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub definition: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub kernel_opts: Option<String>,
}

/// PUT /api/tags/{name} — update or rename a tag. Setting a new non-empty
/// definition triggers a background rebuild of this tag; clearing it to ""
/// freezes the current members as manual associations.
pub async fn update_tag(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<UpdateTagBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let definition_set = matches!(body.definition.as_deref(), Some(d) if !d.is_empty());

    let store = app.store.clone();
    let tag = tokio::task::spawn_blocking(move || {
        store.update_tag(
            &name,
            TagChanges {
                name: body.name,
                definition: body.definition,
                comment: body.comment,
                kernel_opts: body.kernel_opts,
            },
        )
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    if definition_set {
        spawn_tag_rebuild(app.store.clone(), tag.name.clone());
    }

    let store = app.store.clone();
    let tag_name = tag.name.clone();
    let count = tokio::task::spawn_blocking(move || store.nodes_for(&tag_name).map(|n| n.len()))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    Ok(Json(tag_json(&tag, count)))
}

/// DELETE /api/tags/{name} — delete the tag and all its associations.
pub async fn delete_tag(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let store = app.store.clone();
    let deleted = name.clone();
    tokio::task::spawn_blocking(move || store.delete_tag(&name))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

/// GET /api/tags/{name}/nodes — member system_ids.
pub async fn get_tag_nodes(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let store = app.store.clone();
    let nodes = tokio::task::spawn_blocking(move || store.nodes_for(&name))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    Ok(Json(serde_json::json!(nodes)))
}

#[derive(serde::Deserialize)]
pub struct UpdateNodesBody {
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub remove: Vec<String>,
    /// Optional optimistic guard: the definition the caller computed
    /// against. A mismatch with the stored definition is a 409.
    #[serde(default)]
    pub definition: Option<String>,
}

/// POST /api/tags/{name}/nodes — batch manual add/remove.
pub async fn update_tag_nodes(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<UpdateNodesBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let store = app.store.clone();
    let counts = tokio::task::spawn_blocking(move || {
        store.update_nodes(&name, &body.add, &body.remove, body.definition.as_deref())
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    Ok(Json(serde_json::json!({
        "added": counts.added,
        "removed": counts.removed,
    })))
}

/// POST /api/tags/{name}/rebuild — rebuild one tag inline and acknowledge.
pub async fn rebuild_tag(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let store = app.store.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        rebuild::rebuild_tag(&store, store.matcher(), &name)
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    Ok(Json(serde_json::json!({
        "rebuilding": outcome.tag,
        "manual": outcome.manual,
        "added": outcome.added,
        "removed": outcome.removed,
        "failures": outcome.failures,
    })))
}
