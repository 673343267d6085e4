use axum::{
    extract::{Path, State},
    routing::{post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{types::Json as SqlJson, SqlitePool};
use uuid::Uuid;

use crate::{
    db::models::{Issue, IssuePriority, IssueStatus},
    error::{AppError, Result},
    middleware::auth::AuthUser,
    services::access,
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/:id/status", put(update_issue_status))
        .route("/:id/comments", post(add_issue_comment))
}

#[derive(Debug, Deserialize)]
pub struct CreateIssueRequest {
    pub building_id: Option<String>,
    #[serde(default)]
    pub element_ids: Vec<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub priority: IssuePriority,
    pub assigned_to: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub attachments: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateIssueStatusRequest {
    pub status: IssueStatus,
}

#[derive(Debug, Deserialize)]
pub struct AddCommentRequest {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UserSummary {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct CommentResponse {
    pub id: String,
    pub author_id: String,
    pub author_name: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// An issue with its people resolved and comments in insertion order.
#[derive(Debug, Serialize)]
pub struct IssueResponse {
    #[serde(flatten)]
    pub issue: Issue,
    pub creator: Option<UserSummary>,
    pub assignee: Option<UserSummary>,
    pub comments: Vec<CommentResponse>,
}

#[derive(Debug, Serialize)]
pub struct IssueListResponse {
    pub issues: Vec<IssueResponse>,
}

async fn fetch_issue(pool: &SqlitePool, id: &str) -> Result<Issue> {
    sqlx::query_as::<_, Issue>("SELECT * FROM issues WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Issue not found".to_string()))
}

async fn user_summary(pool: &SqlitePool, user_id: &str) -> Result<Option<UserSummary>> {
    let summary = sqlx::query_as::<_, UserSummary>("SELECT name, email FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

    Ok(summary)
}

async fn issue_details(pool: &SqlitePool, issue: Issue) -> Result<IssueResponse> {
    let creator = user_summary(pool, &issue.created_by).await?;
    let assignee = match issue.assigned_to.as_deref() {
        Some(user_id) => user_summary(pool, user_id).await?,
        None => None,
    };

    let comments = sqlx::query_as::<_, CommentResponse>(
        r#"
        SELECT c.id, c.author_id, u.name AS author_name, c.content, c.created_at
        FROM issue_comments c
        LEFT JOIN users u ON u.id = c.author_id
        WHERE c.issue_id = ?
        ORDER BY c.created_at ASC, c.rowid ASC
        "#,
    )
    .bind(&issue.id)
    .fetch_all(pool)
    .await?;

    Ok(IssueResponse {
        issue,
        creator,
        assignee,
        comments,
    })
}

pub(crate) async fn list_project_issues(
    State(state): State<AppState>,
    user: AuthUser,
    Path(project_id): Path<String>,
) -> Result<Json<IssueListResponse>> {
    access::authorize(&state.db.pool, &user, &project_id, None).await?;

    let rows = sqlx::query_as::<_, Issue>(
        "SELECT * FROM issues WHERE project_id = ? ORDER BY created_at DESC, rowid DESC",
    )
    .bind(&project_id)
    .fetch_all(&state.db.pool)
    .await?;

    let mut issues = Vec::with_capacity(rows.len());
    for issue in rows {
        issues.push(issue_details(&state.db.pool, issue).await?);
    }

    Ok(Json(IssueListResponse { issues }))
}

pub(crate) async fn create_issue(
    State(state): State<AppState>,
    user: AuthUser,
    Path(project_id): Path<String>,
    Json(body): Json<CreateIssueRequest>,
) -> Result<Json<IssueResponse>> {
    access::authorize(&state.db.pool, &user, &project_id, None).await?;

    let title = body.title.trim();
    if title.is_empty() {
        return Err(AppError::Validation("Issue title is required".to_string()));
    }

    if let Some(building_id) = body.building_id.as_deref() {
        let owner = sqlx::query_scalar::<_, String>("SELECT project_id FROM buildings WHERE id = ?")
            .bind(building_id)
            .fetch_optional(&state.db.pool)
            .await?;

        if owner.as_deref() != Some(project_id.as_str()) {
            return Err(AppError::Validation(
                "Building does not belong to this project".to_string(),
            ));
        }
    }

    let issue = Issue {
        id: Uuid::new_v4().to_string(),
        project_id,
        building_id: body.building_id,
        element_ids: SqlJson(body.element_ids),
        title: title.to_string(),
        description: body.description,
        priority: body.priority,
        status: IssueStatus::Open,
        assigned_to: body.assigned_to,
        created_by: user.id.clone(),
        due_date: body.due_date,
        attachments: body.attachments.map(SqlJson),
        created_at: Utc::now(),
    };

    sqlx::query(
        r#"
        INSERT INTO issues (id, project_id, building_id, element_ids, title, description, priority, status, assigned_to, created_by, due_date, attachments, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&issue.id)
    .bind(&issue.project_id)
    .bind(&issue.building_id)
    .bind(&issue.element_ids)
    .bind(&issue.title)
    .bind(&issue.description)
    .bind(issue.priority)
    .bind(issue.status)
    .bind(&issue.assigned_to)
    .bind(&issue.created_by)
    .bind(issue.due_date)
    .bind(&issue.attachments)
    .bind(issue.created_at)
    .execute(&state.db.pool)
    .await?;

    tracing::info!(issue_id = %issue.id, project_id = %issue.project_id, "Created issue");

    Ok(Json(issue_details(&state.db.pool, issue).await?))
}

async fn update_issue_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<UpdateIssueStatusRequest>,
) -> Result<Json<IssueResponse>> {
    let issue = fetch_issue(&state.db.pool, &id).await?;
    let member = access::find_membership(&state.db.pool, &issue.project_id, &user.id).await?;

    if !access::can_update_issue(&user.id, &issue, member.as_ref()) {
        return Err(AppError::InsufficientPermission(
            "Only the creator, assignee or a project manager can change issue status".to_string(),
        ));
    }

    sqlx::query("UPDATE issues SET status = ? WHERE id = ?")
        .bind(body.status)
        .bind(&id)
        .execute(&state.db.pool)
        .await?;

    let issue = fetch_issue(&state.db.pool, &id).await?;

    Ok(Json(issue_details(&state.db.pool, issue).await?))
}

async fn add_issue_comment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<AddCommentRequest>,
) -> Result<Json<IssueResponse>> {
    let issue = fetch_issue(&state.db.pool, &id).await?;
    access::authorize(&state.db.pool, &user, &issue.project_id, None).await?;

    let content = body.content.trim();
    if content.is_empty() {
        return Err(AppError::Validation("Comment cannot be empty".to_string()));
    }

    // Single insert, concurrent comments never overwrite each other
    sqlx::query(
        "INSERT INTO issue_comments (id, issue_id, author_id, content, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&issue.id)
    .bind(&user.id)
    .bind(content)
    .bind(Utc::now())
    .execute(&state.db.pool)
    .await?;

    Ok(Json(issue_details(&state.db.pool, issue).await?))
}
