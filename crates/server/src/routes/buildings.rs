use axum::{
    extract::{Path, State},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::types::Json as SqlJson;
use uuid::Uuid;

use crate::{
    db::models::{Building, BuildingElement, BuildingFile, BuildingMetadata, FileStatus},
    error::{AppError, Result},
    middleware::auth::AuthUser,
    services::access::{self, BUILDING_EDITORS},
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/:id", get(get_building))
        .route("/:id/elements", get(get_building_elements))
        .route("/:id/files", get(get_building_files))
        .route("/:id/files/stats", get(get_file_processing_stats))
        .route("/:id/ifc", put(update_building_ifc))
        .route("/:id/process", post(reprocess_latest_file))
}

#[derive(Debug, Deserialize)]
pub struct CreateBuildingRequest {
    pub name: String,
    pub description: Option<String>,
    pub metadata: Option<BuildingMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateIfcRequest {
    pub storage_id: String,
    pub file_name: String,
    pub file_size: i64,
}

#[derive(Debug, Serialize)]
pub struct BuildingListResponse {
    pub buildings: Vec<Building>,
}

#[derive(Debug, Serialize)]
pub struct ElementListResponse {
    pub elements: Vec<BuildingElement>,
}

#[derive(Debug, Serialize)]
pub struct FileListResponse {
    pub files: Vec<BuildingFile>,
}

#[derive(Debug, Default, Serialize, PartialEq)]
pub struct FileProcessingStats {
    pub total: i64,
    pub uploading: i64,
    pub processing: i64,
    pub completed: i64,
    pub error: i64,
}

#[derive(Debug, Serialize)]
pub struct UpdateIfcResponse {
    pub file: BuildingFile,
    pub job_id: String,
}

#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub message: String,
    pub file_id: String,
    pub job_id: String,
}

async fn fetch_building(pool: &sqlx::SqlitePool, id: &str) -> Result<Building> {
    sqlx::query_as::<_, Building>("SELECT * FROM buildings WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Building not found".to_string()))
}

/// Load a building and check the caller belongs to its project.
async fn building_for_member(state: &AppState, user: &AuthUser, id: &str) -> Result<Building> {
    let building = fetch_building(&state.db.pool, id).await?;
    access::authorize(&state.db.pool, user, &building.project_id, None).await?;
    Ok(building)
}

pub(crate) async fn list_project_buildings(
    State(state): State<AppState>,
    user: AuthUser,
    Path(project_id): Path<String>,
) -> Result<Json<BuildingListResponse>> {
    access::authorize(&state.db.pool, &user, &project_id, None).await?;

    let buildings = sqlx::query_as::<_, Building>(
        "SELECT * FROM buildings WHERE project_id = ? ORDER BY created_at ASC, rowid ASC",
    )
    .bind(&project_id)
    .fetch_all(&state.db.pool)
    .await?;

    Ok(Json(BuildingListResponse { buildings }))
}

pub(crate) async fn create_building(
    State(state): State<AppState>,
    user: AuthUser,
    Path(project_id): Path<String>,
    Json(body): Json<CreateBuildingRequest>,
) -> Result<Json<Building>> {
    access::authorize(&state.db.pool, &user, &project_id, Some(BUILDING_EDITORS)).await?;

    let name = body.name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("Building name is required".to_string()));
    }

    let building = Building {
        id: Uuid::new_v4().to_string(),
        project_id,
        name: name.to_string(),
        description: body.description,
        ifc_file_id: None,
        external_model_id: None,
        metadata: body.metadata.map(SqlJson),
        created_at: Utc::now(),
    };

    sqlx::query(
        "INSERT INTO buildings (id, project_id, name, description, metadata, created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&building.id)
    .bind(&building.project_id)
    .bind(&building.name)
    .bind(&building.description)
    .bind(&building.metadata)
    .bind(building.created_at)
    .execute(&state.db.pool)
    .await?;

    tracing::info!(building_id = %building.id, project_id = %building.project_id, "Created building");

    Ok(Json(building))
}

async fn get_building(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Building>> {
    let building = building_for_member(&state, &user, &id).await?;
    Ok(Json(building))
}

async fn get_building_elements(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ElementListResponse>> {
    building_for_member(&state, &user, &id).await?;

    let elements = sqlx::query_as::<_, BuildingElement>(
        "SELECT * FROM building_elements WHERE building_id = ? ORDER BY created_at ASC, rowid ASC",
    )
    .bind(&id)
    .fetch_all(&state.db.pool)
    .await?;

    Ok(Json(ElementListResponse { elements }))
}

async fn get_building_files(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<FileListResponse>> {
    building_for_member(&state, &user, &id).await?;

    let files = sqlx::query_as::<_, BuildingFile>(
        "SELECT * FROM building_files WHERE building_id = ? ORDER BY created_at DESC, rowid DESC",
    )
    .bind(&id)
    .fetch_all(&state.db.pool)
    .await?;

    Ok(Json(FileListResponse { files }))
}

async fn get_file_processing_stats(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<FileProcessingStats>> {
    building_for_member(&state, &user, &id).await?;

    let counts = sqlx::query_as::<_, (FileStatus, i64)>(
        "SELECT status, COUNT(*) FROM building_files WHERE building_id = ? GROUP BY status",
    )
    .bind(&id)
    .fetch_all(&state.db.pool)
    .await?;

    let mut stats = FileProcessingStats::default();
    for (status, count) in counts {
        stats.total += count;
        match status {
            FileStatus::Uploading => stats.uploading = count,
            FileStatus::Processing => stats.processing = count,
            FileStatus::Completed => stats.completed = count,
            FileStatus::Error => stats.error = count,
        }
    }

    Ok(Json(stats))
}

/// Attach an uploaded model to a building and queue it for ingestion.
async fn update_building_ifc(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<UpdateIfcRequest>,
) -> Result<Json<UpdateIfcResponse>> {
    let building = building_for_member(&state, &user, &id).await?;

    if body.file_name.trim().is_empty() {
        return Err(AppError::Validation("File name is required".to_string()));
    }
    if body.file_size < 0 {
        return Err(AppError::Validation("File size must not be negative".to_string()));
    }
    if state.blobs.get_url(&body.storage_id).await?.is_none() {
        return Err(AppError::NotFound("Uploaded file not found".to_string()));
    }

    // Files start in processing; uploading is never assigned here
    let file = BuildingFile {
        id: Uuid::new_v4().to_string(),
        building_id: building.id.clone(),
        storage_id: body.storage_id,
        file_name: body.file_name,
        file_type: "ifc".to_string(),
        file_size: body.file_size,
        status: FileStatus::Processing,
        uploaded_by: user.id.clone(),
        error_message: None,
        processed_at: None,
        created_at: Utc::now(),
    };

    let mut tx = state.db.pool.begin().await?;

    sqlx::query(
        "INSERT INTO building_files (id, building_id, storage_id, file_name, file_type, file_size, status, uploaded_by, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&file.id)
    .bind(&file.building_id)
    .bind(&file.storage_id)
    .bind(&file.file_name)
    .bind(&file.file_type)
    .bind(file.file_size)
    .bind(file.status)
    .bind(&file.uploaded_by)
    .bind(file.created_at)
    .execute(&mut *tx)
    .await?;

    sqlx::query("UPDATE buildings SET ifc_file_id = ? WHERE id = ?")
        .bind(&file.storage_id)
        .bind(&building.id)
        .execute(&mut *tx)
        .await?;

    let job_id = state
        .ingest
        .enqueue(&mut *tx, &building.id, &file.id, &file.storage_id)
        .await?;

    tx.commit().await?;
    state.ingest.wake();

    tracing::info!(building_id = %building.id, file_id = %file.id, %job_id, "Model file attached");

    Ok(Json(UpdateIfcResponse { file, job_id }))
}

/// Queue the most recently uploaded file of a building for another ingestion run.
async fn reprocess_latest_file(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ProcessResponse>> {
    let building = building_for_member(&state, &user, &id).await?;

    let file = sqlx::query_as::<_, BuildingFile>(
        "SELECT * FROM building_files WHERE building_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
    )
    .bind(&building.id)
    .fetch_optional(&state.db.pool)
    .await?
    .ok_or_else(|| AppError::NotFound("No files to process".to_string()))?;

    let mut tx = state.db.pool.begin().await?;

    sqlx::query(
        "UPDATE building_files SET status = ?, error_message = NULL, processed_at = NULL WHERE id = ?",
    )
    .bind(FileStatus::Processing)
    .bind(&file.id)
    .execute(&mut *tx)
    .await?;

    let job_id = state
        .ingest
        .enqueue(&mut *tx, &building.id, &file.id, &file.storage_id)
        .await?;

    tx.commit().await?;
    state.ingest.wake();

    Ok(Json(ProcessResponse {
        message: "Processing started".to_string(),
        file_id: file.id,
        job_id,
    }))
}
