use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, State},
    http::{header, Response, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::{
    error::{AppError, Result},
    middleware::auth::AuthUser,
    AppState,
};

/// Authenticated storage operations.
pub fn router() -> Router<AppState> {
    Router::new().route("/upload-url", post(generate_upload_url))
}

/// Upload and download by capability URL.
pub fn blob_router(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        .route(
            "/upload/:token",
            post(upload_blob).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/:storage_id", get(download_blob))
}

#[derive(Debug, Serialize)]
pub struct UploadUrlResponse {
    pub upload_url: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub storage_id: String,
}

async fn generate_upload_url(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<UploadUrlResponse>> {
    // Scoping to a building happens when the upload is attached
    let upload_url = state.blobs.generate_upload_url().await?;
    tracing::debug!(user_id = %user.id, "Issued upload URL");

    Ok(Json(UploadUrlResponse { upload_url }))
}

async fn upload_blob(
    State(state): State<AppState>,
    Path(token): Path<String>,
    body: Bytes,
) -> Result<Json<UploadResponse>> {
    if body.is_empty() {
        return Err(AppError::Validation("Uploaded file is empty".to_string()));
    }

    let storage_id = state.blobs.store(&token, &body).await?;

    Ok(Json(UploadResponse { storage_id }))
}

async fn download_blob(
    State(state): State<AppState>,
    Path(storage_id): Path<String>,
) -> Result<Response<Body>> {
    let data = state.blobs.fetch(&storage_id).await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from(data))
        .map_err(|e| AppError::Internal(format!("Failed to build response: {e}")))
}
