use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::io::ReaderStream;

use crate::db::{models::Job, queries};
use crate::error::AppError;
use crate::services::settlement::{
    STATUS_CANCELLED, STATUS_CANCELLING, STATUS_COMPLETED, STATUS_QUEUED, TERMINAL_STATUSES,
};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: String,
    pub progress: i32,
    pub processed: i64,
    pub total: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        let download_url = (job.status == STATUS_COMPLETED && !job.result_path.is_empty())
            .then(|| format!("/downloads/{}.csv", job.id));
        JobStatusResponse {
            job_id: job.id,
            status: job.status,
            progress: job.progress,
            processed: job.processed,
            total: job.total,
            download_url,
        }
    }
}

fn parse_date_range(from: &str, to: &str) -> Result<(NaiveDate, NaiveDate), AppError> {
    let from = NaiveDate::parse_from_str(from, "%Y-%m-%d")
        .map_err(|_| AppError::Validation("from must be a YYYY-MM-DD date".to_string()))?;
    let to = NaiveDate::parse_from_str(to, "%Y-%m-%d")
        .map_err(|_| AppError::Validation("to must be a YYYY-MM-DD date".to_string()))?;
    if to < from {
        return Err(AppError::Validation(
            "to must not be before from".to_string(),
        ));
    }
    Ok((from, to))
}

pub async fn create_settlement_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, AppError> {
    let (from, to) = parse_date_range(&req.from, &req.to)?;
    let job_id = state.jobs.start_settlement_job(from, to).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "job_id": job_id, "status": STATUS_QUEUED })),
    ))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let job = queries::get_job(&state.db, &id)
        .await
        .map_err(|e| AppError::not_found_or_db(e, format!("Job {id} not found")))?;
    Ok(Json(JobStatusResponse::from(job)))
}

/// Request cancellation. Persists the cancel_requested flag, then signals
/// the in-memory handle if the pipeline runs in this process. Responds 202
/// whether or not the job was still running.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let job = queries::get_job(&state.db, &id)
        .await
        .map_err(|e| AppError::not_found_or_db(e, format!("Job {id} not found")))?;

    queries::request_job_cancel(&state.db, &id).await?;

    let status = if state.jobs.cancel(&id) {
        queries::mark_job_cancelling(&state.db, &id).await?;
        STATUS_CANCELLING
    } else {
        if !TERMINAL_STATUSES.contains(&job.status.as_str()) {
            queries::set_job_status(&state.db, &id, STATUS_CANCELLED).await?;
        }
        STATUS_CANCELLED
    };

    Ok((StatusCode::ACCEPTED, Json(json!({ "status": status }))))
}

/// Stream a settlement CSV artifact from the artifact directory.
pub async fn download_artifact(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    // Artifact names are job UUIDs; anything that walks the tree is a 404.
    if filename.contains('/') || filename.contains("..") {
        return Err(AppError::NotFound(format!("artifact {filename} not found")));
    }

    let mut name = filename;
    if !name.ends_with(".csv") {
        name.push_str(".csv");
    }

    let path = state.jobs.artifact_dir().join(&name);
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| AppError::NotFound(format!("artifact {name} not found")))?;

    let body = Body::from_stream(ReaderStream::new(file));
    let headers = [
        (header::CONTENT_TYPE, "text/csv".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{name}\""),
        ),
    ];
    Ok((headers, body))
}
