use axum::{
    extract::{Path, State},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json as SqlJson;
use uuid::Uuid;

use crate::{
    db::models::{Project, ProjectMetadata, ProjectStatus, Role},
    error::{AppError, Result},
    middleware::auth::AuthUser,
    routes::{buildings, issues},
    services::access::{self, PROJECT_MANAGERS},
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_projects).post(create_project))
        .route("/repair-memberships", post(fix_project_memberships))
        .route("/:id", get(get_project))
        .route("/:id/status", put(update_project_status))
        .route("/:id/members", get(list_members).post(add_member))
        .route(
            "/:id/buildings",
            get(buildings::list_project_buildings).post(buildings::create_building),
        )
        .route(
            "/:id/issues",
            get(issues::list_project_issues).post(issues::create_issue),
        )
}

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub description: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub metadata: Option<ProjectMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: ProjectStatus,
}

/// A project together with the caller's role in it.
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ProjectWithRole {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub project: Project,
    pub user_role: Role,
}

#[derive(Debug, Serialize)]
pub struct ProjectListResponse {
    pub projects: Vec<ProjectWithRole>,
}

#[derive(Debug, Serialize)]
pub struct RepairResponse {
    pub fixed: u64,
    pub message: String,
}

async fn fetch_project(pool: &sqlx::SqlitePool, id: &str) -> Result<Project> {
    sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Project not found".to_string()))
}

async fn list_projects(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<ProjectListResponse>> {
    // Inner join drops memberships whose project no longer exists
    let projects = sqlx::query_as::<_, ProjectWithRole>(
        r#"
        SELECT p.*, pm.role AS user_role
        FROM project_members pm
        JOIN projects p ON p.id = pm.project_id
        WHERE pm.user_id = ?
        ORDER BY p.created_at DESC
        "#,
    )
    .bind(&user.id)
    .fetch_all(&state.db.pool)
    .await?;

    Ok(Json(ProjectListResponse { projects }))
}

async fn create_project(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<CreateProjectRequest>,
) -> Result<Json<ProjectWithRole>> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("Project name is required".to_string()));
    }

    let now = Utc::now();
    let start_date = body.start_date.unwrap_or(now);
    if body.end_date.is_some_and(|end| end < start_date) {
        return Err(AppError::Validation(
            "End date must not be before start date".to_string(),
        ));
    }

    let project = Project {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        description: body.description,
        status: ProjectStatus::Planning,
        created_by: user.id.clone(),
        start_date,
        end_date: body.end_date,
        metadata: body.metadata.map(SqlJson),
        created_at: now,
    };

    // Project and owner membership commit together
    let mut tx = state.db.pool.begin().await?;

    sqlx::query(
        "INSERT INTO projects (id, name, description, status, created_by, start_date, end_date, metadata, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&project.id)
    .bind(&project.name)
    .bind(&project.description)
    .bind(project.status)
    .bind(&project.created_by)
    .bind(project.start_date)
    .bind(project.end_date)
    .bind(&project.metadata)
    .bind(project.created_at)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO project_members (project_id, user_id, role, permissions) VALUES (?, ?, ?, ?)",
    )
    .bind(&project.id)
    .bind(&user.id)
    .bind(Role::Owner)
    .bind(SqlJson(Role::Owner.default_permissions()))
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!(project_id = %project.id, user_id = %user.id, "Created project");

    Ok(Json(ProjectWithRole {
        project,
        user_role: Role::Owner,
    }))
}

async fn get_project(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ProjectWithRole>> {
    let project = fetch_project(&state.db.pool, &id).await?;
    let user_role = access::authorize_project_read(&state.db.pool, &user, &project).await?;

    Ok(Json(ProjectWithRole { project, user_role }))
}

async fn update_project_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<UpdateStatusRequest>,
) -> Result<Json<ProjectWithRole>> {
    let member = access::authorize(&state.db.pool, &user, &id, Some(PROJECT_MANAGERS)).await?;

    // Any status may follow any other
    sqlx::query("UPDATE projects SET status = ? WHERE id = ?")
        .bind(body.status)
        .bind(&id)
        .execute(&state.db.pool)
        .await?;

    let project = fetch_project(&state.db.pool, &id).await?;

    Ok(Json(ProjectWithRole {
        project,
        user_role: member.role,
    }))
}

/// Insert the owner membership for any project the caller created without one.
async fn fix_project_memberships(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<RepairResponse>> {
    let missing = sqlx::query_scalar::<_, String>(
        r#"
        SELECT p.id FROM projects p
        LEFT JOIN project_members pm ON pm.project_id = p.id AND pm.user_id = ?
        WHERE p.created_by = ? AND pm.user_id IS NULL
        "#,
    )
    .bind(&user.id)
    .bind(&user.id)
    .fetch_all(&state.db.pool)
    .await?;

    let mut fixed = 0;
    for project_id in missing {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO project_members (project_id, user_id, role, permissions) VALUES (?, ?, ?, ?)",
        )
        .bind(&project_id)
        .bind(&user.id)
        .bind(Role::Owner)
        .bind(SqlJson(Role::Owner.default_permissions()))
        .execute(&state.db.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::warn!(%project_id, user_id = %user.id, "Restored missing owner membership");
            fixed += result.rows_affected();
        }
    }

    Ok(Json(RepairResponse {
        fixed,
        message: format!("Fixed {fixed} projects"),
    }))
}

// Member types
#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct MemberResponse {
    pub user_id: String,
    pub user_name: Option<String>,
    pub user_email: Option<String>,
    pub role: Role,
    pub permissions: SqlJson<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct MembersListResponse {
    pub members: Vec<MemberResponse>,
}

async fn list_members(
    State(state): State<AppState>,
    user: AuthUser,
    Path(project_id): Path<String>,
) -> Result<Json<MembersListResponse>> {
    access::authorize(&state.db.pool, &user, &project_id, None).await?;

    let members = sqlx::query_as::<_, MemberResponse>(
        r#"
        SELECT pm.user_id, u.name AS user_name, u.email AS user_email, pm.role, pm.permissions
        FROM project_members pm
        LEFT JOIN users u ON u.id = pm.user_id
        WHERE pm.project_id = ?
        ORDER BY u.name ASC
        "#,
    )
    .bind(&project_id)
    .fetch_all(&state.db.pool)
    .await?;

    Ok(Json(MembersListResponse { members }))
}

async fn add_member(
    State(state): State<AppState>,
    user: AuthUser,
    Path(project_id): Path<String>,
    Json(body): Json<AddMemberRequest>,
) -> Result<Json<MemberResponse>> {
    access::authorize(&state.db.pool, &user, &project_id, Some(PROJECT_MANAGERS)).await?;

    if body.role == Role::Owner {
        return Err(AppError::Validation(
            "The owner role cannot be granted".to_string(),
        ));
    }

    // Emails come from identity claims and are not unique across users
    let mut matches = sqlx::query_as::<_, (String, String, String)>(
        "SELECT id, name, email FROM users WHERE email = ? LIMIT 2",
    )
    .bind(&body.email)
    .fetch_all(&state.db.pool)
    .await?;

    if matches.len() > 1 {
        return Err(AppError::Validation(
            "Several users share this email".to_string(),
        ));
    }
    let (target_id, target_name, target_email) = matches
        .pop()
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

    if target_id == user.id {
        return Err(AppError::Validation(
            "Cannot change your own membership".to_string(),
        ));
    }

    if let Some(existing) = access::find_membership(&state.db.pool, &project_id, &target_id).await? {
        if existing.role == Role::Owner {
            return Err(AppError::InsufficientPermission(
                "The project owner's role cannot be changed".to_string(),
            ));
        }
    }

    let permissions = body.role.default_permissions();

    sqlx::query(
        r#"
        INSERT INTO project_members (project_id, user_id, role, permissions) VALUES (?, ?, ?, ?)
        ON CONFLICT(project_id, user_id) DO UPDATE SET role = excluded.role, permissions = excluded.permissions
        "#,
    )
    .bind(&project_id)
    .bind(&target_id)
    .bind(body.role)
    .bind(SqlJson(&permissions))
    .execute(&state.db.pool)
    .await?;

    tracing::info!(%project_id, user_id = %target_id, role = body.role.as_str(), "Set project member role");

    Ok(Json(MemberResponse {
        user_id: target_id,
        user_name: Some(target_name),
        user_email: Some(target_email),
        role: body.role,
        permissions: SqlJson(permissions),
    }))
}
