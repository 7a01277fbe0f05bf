use axum::extract::{Path, State};
use axum::Json;
use nodetag_core::node::Node;
use nodetag_core::{rebuild, TagError};

use crate::error::AppError;
use crate::state::AppState;

fn node_json(node: &Node, tags: &[String]) -> serde_json::Value {
    serde_json::json!({
        "system_id": node.system_id,
        "hostname": node.hostname,
        "tags": tags,
        "registered_at": node.registered_at,
        "facts_updated_at": node.facts_updated_at,
    })
}

/// GET /api/nodes — list registered nodes with their tags.
pub async fn list_nodes(
    State(app): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let store = app.store.clone();
    let result = tokio::task::spawn_blocking(move || {
        let nodes = store.list_nodes()?;
        let mut list = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let tags = store.tags_for_node(&node.system_id)?;
            list.push(node_json(node, &tags));
        }
        Ok::<_, TagError>(serde_json::json!(list))
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    Ok(Json(result))
}

#[derive(serde::Deserialize)]
pub struct RegisterNodeBody {
    pub system_id: String,
    #[serde(default)]
    pub hostname: Option<String>,
    /// Hardware facts XML from the commissioning listing tool.
    pub facts: String,
}

/// POST /api/nodes — register a node with its facts and evaluate every
/// definition-bearing tag against it, so a freshly commissioned node gets
/// its automatic tags straight away.
pub async fn register_node(
    State(app): State<AppState>,
    Json(body): Json<RegisterNodeBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let store = app.store.clone();
    let result = tokio::task::spawn_blocking(move || {
        let node = store.register_node(&body.system_id, body.hostname, &body.facts)?;
        let refresh = rebuild::refresh_node(&store, store.matcher(), &node.system_id)?;
        let mut detail = node_json(&node, &refresh.tagged);
        detail["refresh"] = serde_json::to_value(&refresh)?;
        Ok::<_, TagError>(detail)
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    Ok(Json(result))
}

/// GET /api/nodes/{system_id} — node detail with its tags.
pub async fn get_node(
    State(app): State<AppState>,
    Path(system_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let store = app.store.clone();
    let result = tokio::task::spawn_blocking(move || {
        let node = store.get_node(&system_id)?;
        let tags = store.tags_for_node(&system_id)?;
        Ok::<_, TagError>(node_json(&node, &tags))
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    Ok(Json(result))
}

#[derive(serde::Deserialize)]
pub struct SetFactsBody {
    pub facts: String,
}

/// PUT /api/nodes/{system_id}/facts — refresh facts and re-evaluate the
/// node against every definition-bearing tag, returning what changed.
pub async fn set_facts(
    State(app): State<AppState>,
    Path(system_id): Path<String>,
    Json(body): Json<SetFactsBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let store = app.store.clone();
    let refresh = tokio::task::spawn_blocking(move || {
        store.set_node_facts(&system_id, &body.facts)?;
        rebuild::refresh_node(&store, store.matcher(), &system_id)
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    Ok(Json(serde_json::to_value(&refresh).map_err(TagError::from)?))
}

/// DELETE /api/nodes/{system_id} — deregister and scrub memberships.
pub async fn delete_node(
    State(app): State<AppState>,
    Path(system_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let store = app.store.clone();
    let removed = system_id.clone();
    let scrubbed = tokio::task::spawn_blocking(move || store.deregister_node(&system_id))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    Ok(Json(serde_json::json!({
        "removed": removed,
        "scrubbed_from": scrubbed,
    })))
}
