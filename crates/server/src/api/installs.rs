//! Install API handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use decklift_core::pipeline::CleanupReport;
use decklift_core::{JobError, JobId, JobSpec, JobStatus, OrchestratorError, OrchestratorStatus};

use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Response for a newly queued install
#[derive(Debug, Serialize)]
pub struct CreateInstallResponse {
    pub job_id: JobId,
}

/// Response for cleanup of a cancelled or failed install
#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub job_id: JobId,
    pub summary: String,
    #[serde(flatten)]
    pub report: CleanupReport,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct InstallErrorResponse {
    pub error: String,
}

/// Maps orchestrator errors onto HTTP responses.
pub struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            OrchestratorError::Job(JobError::InvalidJob(_)) => StatusCode::BAD_REQUEST,
            OrchestratorError::Job(JobError::NotFound(_)) => StatusCode::NOT_FOUND,
            OrchestratorError::Job(
                JobError::Duplicate { .. }
                | JobError::NotTerminal(_)
                | JobError::AlreadyFinished(_)
                | JobError::NotCleanable(_),
            ) => StatusCode::CONFLICT,
            OrchestratorError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(InstallErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

fn not_found(id: JobId) -> ApiError {
    ApiError(JobError::NotFound(id).into())
}

// ============================================================================
// Handlers
// ============================================================================

/// `POST /installs`
pub async fn create_install(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<JobSpec>,
) -> Result<impl IntoResponse, ApiError> {
    let app_id = spec.app_id.clone();
    let job_id = state
        .orchestrator()
        .enqueue_install(spec)
        .await
        .inspect_err(|e| warn!(app_id = %app_id, error = %e, "Install rejected"))?;

    info!(%job_id, app_id = %app_id, "Install queued");
    Ok((StatusCode::CREATED, Json(CreateInstallResponse { job_id })))
}

/// `GET /installs`
pub async fn list_installs(State(state): State<Arc<AppState>>) -> Json<OrchestratorStatus> {
    Json(state.orchestrator().status().await)
}

/// `GET /installs/{id}`
pub async fn get_install(
    State(state): State<Arc<AppState>>,
    Path(id): Path<JobId>,
) -> Result<Json<JobStatus>, ApiError> {
    state
        .orchestrator()
        .job(id)
        .await
        .map(Json)
        .ok_or_else(|| not_found(id))
}

/// `DELETE /installs/{id}`
pub async fn cancel_install(
    State(state): State<Arc<AppState>>,
    Path(id): Path<JobId>,
) -> Result<Json<JobStatus>, ApiError> {
    let orchestrator = state.orchestrator();
    orchestrator.cancel_install(id).await?;
    info!(job_id = %id, "Cancel requested");
    orchestrator.job(id).await.map(Json).ok_or_else(|| not_found(id))
}

/// `POST /installs/{id}/pause`
pub async fn pause_install(
    State(state): State<Arc<AppState>>,
    Path(id): Path<JobId>,
) -> Result<Json<JobStatus>, ApiError> {
    let orchestrator = state.orchestrator();
    orchestrator.pause_install(id).await?;
    orchestrator.job(id).await.map(Json).ok_or_else(|| not_found(id))
}

/// `POST /installs/{id}/resume`
pub async fn resume_install(
    State(state): State<Arc<AppState>>,
    Path(id): Path<JobId>,
) -> Result<Json<JobStatus>, ApiError> {
    let orchestrator = state.orchestrator();
    orchestrator.resume_install(id).await?;
    orchestrator.job(id).await.map(Json).ok_or_else(|| not_found(id))
}

/// `POST /installs/{id}/cleanup`
pub async fn cleanup_install(
    State(state): State<Arc<AppState>>,
    Path(id): Path<JobId>,
) -> Result<Json<CleanupResponse>, ApiError> {
    let report = state.orchestrator().cleanup_cancelled(id).await?;
    let summary = report.summary();
    info!(job_id = %id, %summary, "Cleanup finished");
    Ok(Json(CleanupResponse {
        job_id: id,
        summary,
        report,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let id = JobId::new();
        let cases = [
            (JobError::invalid("no depot items"), StatusCode::BAD_REQUEST),
            (JobError::NotFound(id), StatusCode::NOT_FOUND),
            (
                JobError::Duplicate {
                    app_id: "220".to_string(),
                    existing: id,
                },
                StatusCode::CONFLICT,
            ),
            (JobError::NotTerminal(id), StatusCode::CONFLICT),
            (JobError::AlreadyFinished(id), StatusCode::CONFLICT),
            (JobError::NotCleanable(id), StatusCode::CONFLICT),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError(err.into()).status(), expected);
        }
    }

    #[test]
    fn test_io_error_is_internal() {
        let err = OrchestratorError::Io(std::io::Error::other("disk gone"));
        assert_eq!(ApiError(err).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
