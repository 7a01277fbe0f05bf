use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use nodetag_core::rebuild;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

/// POST /api/rebuild — start a global rebuild in the background and return
/// the job id for polling. Refused with 409 while one is already running.
pub async fn start_rebuild(
    State(app): State<AppState>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let id = {
        let mut jobs = app.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.start()
            .ok_or_else(|| AppError::conflict("a rebuild is already running"))?
    };

    let store = app.store.clone();
    let registry = app.jobs.clone();
    tokio::spawn(async move {
        let result =
            tokio::task::spawn_blocking(move || rebuild::rebuild_all(&store, store.matcher()))
                .await;
        let outcome = match result {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("task join error: {e}")),
        };
        if let Err(e) = &outcome {
            tracing::warn!("global rebuild failed: {e}");
        }
        registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .finish(id, outcome);
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "job_id": id, "status": "running" })),
    ))
}

/// GET /api/rebuilds — all rebuild jobs, newest first.
pub async fn list_rebuilds(
    State(app): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let jobs = app.jobs.lock().unwrap_or_else(|e| e.into_inner()).list();
    Ok(Json(serde_json::json!(jobs)))
}

/// GET /api/rebuilds/{id} — one job, for completion polling.
pub async fn get_rebuild(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id: Uuid = id
        .parse()
        .map_err(|_| AppError::bad_request(format!("invalid job id: {id}")))?;

    let jobs = app.jobs.lock().unwrap_or_else(|e| e.into_inner());
    let job = jobs
        .get(id)
        .ok_or_else(|| AppError::not_found(format!("rebuild job not found: {id}")))?;
    Ok(Json(serde_json::to_value(job).map_err(anyhow::Error::from)?))
}
