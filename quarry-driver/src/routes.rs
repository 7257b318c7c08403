use crate::error::{AppError, RpcReply};
use crate::state::SharedState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use quarry_core::protocol::{
    BackupResponse, HealthResponse, JobRecord, JobSubmitRequest, JobSubmitResponse,
    RestoreRequest, RestoreResponse,
};
use quarry_core::{CorruptionMarker, IntegrityReport, RpcRequest};

// POST /rpc
pub async fn rpc(State(state): State<SharedState>, Json(request): Json<RpcRequest>) -> RpcReply {
    let op = request.op_name();
    let start = std::time::Instant::now();
    let result = state.executor.rpc(request).await;
    tracing::debug!(op, ok = result.is_ok(), elapsed_ms = start.elapsed().as_millis() as u64, "rpc");
    RpcReply(result)
}

// GET /health
pub async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let safe_mode = CorruptionMarker::exists(&state.settings.db_path);
    Json(HealthResponse {
        status: if safe_mode { "safe_mode" } else { "ok" }.to_string(),
        db_path: state.settings.db_path.clone(),
        safe_mode,
        queue_depth: state.executor.queue_depth(),
        open_transaction: state.executor.open_transaction(),
    })
}

// POST /admin/integrity
pub async fn integrity(State(state): State<SharedState>) -> Result<Json<IntegrityReport>, AppError> {
    let report = state.executor.integrity().await?;
    tracing::info!(status = ?report.status, check = %report.check, "integrity probe");
    Ok(Json(report))
}

// POST /admin/backup
pub async fn backup(State(state): State<SharedState>) -> Result<Json<BackupResponse>, AppError> {
    let backup_paths = state.executor.backup().await?;
    Ok(Json(BackupResponse { backup_paths }))
}

// POST /admin/recreate
pub async fn recreate(State(state): State<SharedState>) -> Result<Json<BackupResponse>, AppError> {
    let backup_paths = state.executor.recreate().await?;
    Ok(Json(BackupResponse { backup_paths }))
}

// POST /admin/restore
pub async fn restore(
    State(state): State<SharedState>,
    Json(req): Json<RestoreRequest>,
) -> Result<Json<RestoreResponse>, AppError> {
    Ok(Json(state.executor.restore(req.backup_path).await?))
}

// POST /jobs
pub async fn submit_job(
    State(state): State<SharedState>,
    Json(req): Json<JobSubmitRequest>,
) -> Result<(StatusCode, Json<JobSubmitResponse>), AppError> {
    let job_id = state.jobs.submit(&state.executor, req.sql, req.params)?;
    Ok((StatusCode::ACCEPTED, Json(JobSubmitResponse { job_id })))
}

// GET /jobs/{id}
pub async fn get_job(
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobRecord>, AppError> {
    Ok(Json(state.jobs.get(&job_id)?))
}

// DELETE /jobs/{id}
pub async fn delete_job(
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.jobs.remove(&job_id)?;
    Ok(StatusCode::NO_CONTENT)
}
