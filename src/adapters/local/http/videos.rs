use crate::application::intake::{IntakeError, IntakeService, Upload};
use crate::ports::queue::TaskQueue;
use crate::ports::repository::VideoRepository;
use crate::ports::storage::ObjectStore;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::error;

pub const USER_HEADER: &str = "x-user-id";

type Intake<Q, R, S> = Arc<IntakeService<Q, R, S>>;

pub fn router<Q, R, S>(intake: Intake<Q, R, S>, max_upload_bytes: usize) -> Router
where
    Q: TaskQueue + 'static,
    R: VideoRepository + 'static,
    S: ObjectStore + 'static,
{
    Router::new()
        .route("/api/videos/upload", post(upload_video::<Q, R, S>))
        .route(
            "/api/videos/:video_id",
            get(get_video::<Q, R, S>).delete(delete_video::<Q, R, S>),
        )
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .with_state(intake)
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<IntakeError> for ApiError {
    fn from(err: IntakeError) -> Self {
        let status = match &err {
            IntakeError::InvalidUpload(_) => StatusCode::BAD_REQUEST,
            IntakeError::NotFound(_) => StatusCode::NOT_FOUND,
            IntakeError::Forbidden(_) => StatusCode::FORBIDDEN,
            IntakeError::NotWithdrawable { .. } => StatusCode::CONFLICT,
            IntakeError::Storage(_) | IntakeError::Repository(_) | IntakeError::Queue(_) => {
                error!(error = %err, "request failed");
                return Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
            }
        };
        Self::new(status, err.to_string())
    }
}

fn caller(headers: &HeaderMap) -> Result<u64, ApiError> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "missing or invalid X-User-Id"))
}

async fn upload_video<Q, R, S>(
    State(intake): State<Intake<Q, R, S>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError>
where
    Q: TaskQueue,
    R: VideoRepository,
    S: ObjectStore,
{
    let owner_id = caller(&headers)?;
    let mut title = None;
    let mut file: Option<(String, Bytes)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?
    {
        let bad_field = |e: axum::extract::multipart::MultipartError| {
            ApiError::new(StatusCode::BAD_REQUEST, e.to_string())
        };
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("title") => title = Some(field.text().await.map_err(bad_field)?),
            Some("video_file") => {
                let file_name = field.file_name().unwrap_or("upload.mp4").to_string();
                file = Some((file_name, field.bytes().await.map_err(bad_field)?));
            }
            _ => continue,
        }
    }

    let title = title.ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "title is required"))?;
    let (file_name, body) =
        file.ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "video_file is required"))?;

    let submission = intake
        .submit(Upload {
            owner_id,
            title,
            file_name,
            body,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "video uploaded; processing has been scheduled",
            "video_id": submission.video.id,
            "task_id": submission.task_id,
        })),
    ))
}

async fn get_video<Q, R, S>(
    State(intake): State<Intake<Q, R, S>>,
    Path(video_id): Path<u64>,
) -> Result<Response, ApiError>
where
    Q: TaskQueue,
    R: VideoRepository,
    S: ObjectStore,
{
    let view = intake.view(video_id).await?;
    Ok(Json(view).into_response())
}

async fn delete_video<Q, R, S>(
    State(intake): State<Intake<Q, R, S>>,
    headers: HeaderMap,
    Path(video_id): Path<u64>,
) -> Result<StatusCode, ApiError>
where
    Q: TaskQueue,
    R: VideoRepository,
    S: ObjectStore,
{
    let owner_id = caller(&headers)?;
    intake.withdraw(video_id, owner_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
