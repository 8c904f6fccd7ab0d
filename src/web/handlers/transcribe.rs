use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    extract::multipart::Field,
    http::StatusCode,
    response::Response,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::schedule::types::TaskStatus;
use crate::schedule::{TaskConfig, TaskError, TranscribeOptions};
use crate::storage::artifact::{self, ArtifactError, ArtifactStore, SUPPORTED_EXTENSIONS};
use crate::utils::http::{error_response, ApiResponse};
use crate::web::Pagination;
use crate::AppContext;

pub fn transcribe_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        // the artifact writer enforces the upload size limit itself
        .route("/upload", post(upload_audio).layer(DefaultBodyLimit::disable()))
        .route("/url", post(transcribe_url))
        .route("/status/:task_id", get(get_task_status))
        .route("/result/:task_id", get(get_task_result))
        .route("/task/:task_id/cancel", post(cancel_task))
        .route("/task/:task_id", delete(delete_task))
        .route("/tasks", get(list_tasks))
        .with_state(ctx)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskCreated {
    pub task_id: String,
    pub status: TaskStatus,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskDeleted {
    pub task_id: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct UrlRequest {
    pub audio_url: String,
    #[serde(flatten)]
    pub options: TranscribeOptions,
    #[serde(default)]
    pub retain_input: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub index: Option<u64>,
    pub size: Option<u64>,
    pub status: Option<String>,
}

pub(crate) fn task_error_response(e: &TaskError) -> Response {
    let status = match e {
        TaskError::NotFound(_) => StatusCode::NOT_FOUND,
        TaskError::InvalidTransition { .. } => StatusCode::CONFLICT,
        TaskError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
        TaskError::NotReady { .. } => StatusCode::ACCEPTED,
        TaskError::Failed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        TaskError::Cancelled(_) => StatusCode::GONE,
        TaskError::InvalidParams(_) => StatusCode::BAD_REQUEST,
        TaskError::AlreadyExists(_) => StatusCode::INTERNAL_SERVER_ERROR,
        TaskError::SchedulerUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e.to_string())
}

fn artifact_error_response(e: &ArtifactError) -> Response {
    match e {
        ArtifactError::MissingFilename => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        ArtifactError::UnsupportedFormat(_) => error_response(
            StatusCode::BAD_REQUEST,
            format!("{}. Supported formats: {}", e, SUPPORTED_EXTENSIONS.join(", ")),
        ),
        ArtifactError::TooLarge { .. } => error_response(StatusCode::PAYLOAD_TOO_LARGE, e.to_string()),
        ArtifactError::Download(_) => error_response(StatusCode::BAD_GATEWAY, e.to_string()),
        ArtifactError::Io(_) => {
            error!("Failed to store audio: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Queues a task for an already stored artifact, releasing it if the task
/// cannot be created.
async fn submit(ctx: &AppContext, config: TaskConfig) -> Response {
    let input_path = config.input_path.clone();
    match ctx.task_manager.create_task(config).await {
        Ok(task) => {
            let created = TaskCreated {
                task_id: task.id,
                status: task.status,
                message: "Audio received. Transcription job queued.".to_string(),
            };
            ApiResponse::success(created).reply(StatusCode::OK)
        }
        Err(e) => {
            warn!("Failed to create task: {}", e);
            artifact::release(&input_path).await;
            task_error_response(&e)
        }
    }
}

#[derive(Default)]
struct UploadForm {
    file: Option<PathBuf>,
    options: TranscribeOptions,
    retain_input: bool,
}

async fn save_field(artifacts: &ArtifactStore, mut field: Field<'_>) -> Result<PathBuf, Response> {
    let filename = field.file_name().unwrap_or_default().to_string();
    let mut writer = artifacts
        .create(&filename)
        .await
        .map_err(|e| artifact_error_response(&e))?;

    loop {
        match field.chunk().await {
            Ok(Some(chunk)) => {
                if let Err(e) = writer.write_chunk(&chunk).await {
                    writer.abort().await;
                    return Err(artifact_error_response(&e));
                }
            }
            Ok(None) => break,
            Err(e) => {
                writer.abort().await;
                return Err(error_response(StatusCode::BAD_REQUEST, format!("Failed to read upload: {}", e)));
            }
        }
    }
    writer.finish().await.map_err(|e| artifact_error_response(&e))
}

async fn read_form(artifacts: &ArtifactStore, multipart: &mut Multipart, form: &mut UploadForm) -> Result<(), Response> {
    let bad_request = |message: String| error_response(StatusCode::BAD_REQUEST, message);

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("Invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            if form.file.is_some() {
                return Err(bad_request("Only one file may be uploaded per task".to_string()));
            }
            form.file = Some(save_field(artifacts, field).await?);
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| bad_request(format!("Invalid field {}: {}", name, e)))?;
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let invalid = || bad_request(format!("Invalid value for {}: {}", name, value));
        match name.as_str() {
            "language" => form.options.language = Some(value.to_string()),
            "min_speakers" => form.options.min_speakers = Some(value.parse().map_err(|_| invalid())?),
            "max_speakers" => form.options.max_speakers = Some(value.parse().map_err(|_| invalid())?),
            "enable_diarization" => form.options.enable_diarization = parse_bool(value).ok_or_else(invalid)?,
            "retain_input" => form.retain_input = parse_bool(value).ok_or_else(invalid)?,
            _ => {}
        }
    }
    Ok(())
}

async fn upload_audio(State(ctx): State<Arc<AppContext>>, mut multipart: Multipart) -> Response {
    let mut form = UploadForm::default();
    if let Err(response) = read_form(&ctx.artifacts, &mut multipart, &mut form).await {
        if let Some(path) = &form.file {
            artifact::release(path).await;
        }
        return response;
    }

    let Some(input_path) = form.file else {
        return artifact_error_response(&ArtifactError::MissingFilename);
    };
    info!("Received upload: {}", input_path.display());

    let config = TaskConfig::new(input_path, form.options).with_retain_input(form.retain_input);
    submit(&ctx, config).await
}

async fn transcribe_url(State(ctx): State<Arc<AppContext>>, Json(req): Json<UrlRequest>) -> Response {
    let input_path = match ctx.artifacts.download(&req.audio_url).await {
        Ok(path) => path,
        Err(e) => {
            warn!("Failed to download {}: {}", req.audio_url, e);
            return artifact_error_response(&e);
        }
    };

    let config = TaskConfig::new(input_path, req.options).with_retain_input(req.retain_input);
    submit(&ctx, config).await
}

async fn get_task_status(State(ctx): State<Arc<AppContext>>, Path(task_id): Path<String>) -> Response {
    match ctx.task_manager.get_progress(&task_id).await {
        Ok(progress) => ApiResponse::success(progress).reply(StatusCode::OK),
        Err(e) => task_error_response(&e),
    }
}

async fn get_task_result(State(ctx): State<Arc<AppContext>>, Path(task_id): Path<String>) -> Response {
    match ctx.task_manager.get_result(&task_id).await {
        Ok(result) => ApiResponse::success(result).reply(StatusCode::OK),
        Err(e) => task_error_response(&e),
    }
}

async fn cancel_task(State(ctx): State<Arc<AppContext>>, Path(task_id): Path<String>) -> Response {
    match ctx.task_manager.cancel_task(&task_id).await {
        Ok(task) => ApiResponse::success(task.progress_view()).reply(StatusCode::OK),
        Err(e) => task_error_response(&e),
    }
}

async fn delete_task(State(ctx): State<Arc<AppContext>>, Path(task_id): Path<String>) -> Response {
    match ctx.task_manager.delete_task(&task_id).await {
        Ok(task) => {
            let deleted = TaskDeleted {
                task_id: task.id,
                message: "Task deleted".to_string(),
            };
            ApiResponse::success(deleted).reply(StatusCode::OK)
        }
        Err(e) => task_error_response(&e),
    }
}

async fn list_tasks(State(ctx): State<Arc<AppContext>>, Query(query): Query<ListQuery>) -> Response {
    let defaults = Pagination::default();
    let pagination = Pagination {
        index: query.index.unwrap_or(defaults.index),
        size: query.size.unwrap_or(defaults.size),
    };
    let status = match query.status.as_deref().map(TaskStatus::try_from).transpose() {
        Ok(status) => status,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    match ctx.task_manager.list_tasks(&pagination, status).await {
        Ok(page) => ApiResponse::success(page).reply(StatusCode::OK),
        Err(e) => task_error_response(&e),
    }
}
