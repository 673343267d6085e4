//! Project-scoped authorization.
//!
//! Every project, building and issue operation resolves the caller's
//! membership here before touching the store. Checks are read-only.

use sqlx::SqlitePool;

use crate::{
    db::models::{Issue, Project, ProjectMember, Role},
    error::{AppError, Result},
    middleware::auth::AuthUser,
};

/// Roles allowed to create buildings.
pub const BUILDING_EDITORS: &[Role] = &[Role::Owner, Role::Admin, Role::Architect];

/// Roles allowed to change project status and manage members.
pub const PROJECT_MANAGERS: &[Role] = &[Role::Owner, Role::Admin];

pub async fn find_membership(
    pool: &SqlitePool,
    project_id: &str,
    user_id: &str,
) -> Result<Option<ProjectMember>> {
    let member = sqlx::query_as::<_, ProjectMember>(
        "SELECT project_id, user_id, role, permissions FROM project_members WHERE project_id = ? AND user_id = ?",
    )
    .bind(project_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(member)
}

/// Resolve the caller's membership, optionally requiring one of `required` roles.
pub async fn authorize(
    pool: &SqlitePool,
    user: &AuthUser,
    project_id: &str,
    required: Option<&[Role]>,
) -> Result<ProjectMember> {
    let member = find_membership(pool, project_id, &user.id)
        .await?
        .ok_or_else(|| AppError::AccessDenied("No access to this project".to_string()))?;

    if let Some(roles) = required {
        check_role(member.role, roles)?;
    }

    Ok(member)
}

pub fn check_role(role: Role, required: &[Role]) -> Result<()> {
    if required.contains(&role) {
        Ok(())
    } else {
        tracing::debug!(role = role.as_str(), ?required, "Role check failed");
        Err(AppError::InsufficientPermission(
            "Insufficient permissions".to_string(),
        ))
    }
}

/// Read access to a single project. The creator is treated as owner even
/// when their membership row is missing.
pub async fn authorize_project_read(
    pool: &SqlitePool,
    user: &AuthUser,
    project: &Project,
) -> Result<Role> {
    match find_membership(pool, &project.id, &user.id).await? {
        Some(member) => Ok(member.role),
        None if project.created_by == user.id => {
            tracing::warn!(
                project_id = %project.id,
                user_id = %user.id,
                "Creator has no membership row, granting implicit owner"
            );
            Ok(Role::Owner)
        }
        None => Err(AppError::AccessDenied(
            "No access to this project".to_string(),
        )),
    }
}

/// Issue status may be changed by its creator, its assignee, or a project owner/admin.
pub fn can_update_issue(user_id: &str, issue: &Issue, member: Option<&ProjectMember>) -> bool {
    issue.created_by == user_id
        || issue.assigned_to.as_deref() == Some(user_id)
        || member.is_some_and(|m| PROJECT_MANAGERS.contains(&m.role))
}
