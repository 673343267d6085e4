use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ProjectStatus {
    Planning,
    Design,
    Construction,
    Operation,
    Completed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub status: ProjectStatus,
    pub created_by: String,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub metadata: Option<Json<ProjectMetadata>>,
    pub created_at: DateTime<Utc>,
}

/// Membership role within a project, ordered from most to least privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Architect,
    Engineer,
    Contractor,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Architect => "architect",
            Role::Engineer => "engineer",
            Role::Contractor => "contractor",
            Role::Viewer => "viewer",
        }
    }

    /// Permission strings stored on a membership granted with this role.
    pub fn default_permissions(&self) -> Vec<String> {
        let perms: &[&str] = match self {
            Role::Owner | Role::Admin => &["read", "write", "admin"],
            Role::Architect | Role::Engineer | Role::Contractor => &["read", "write"],
            Role::Viewer => &["read"],
        };
        perms.iter().map(|p| p.to_string()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProjectMember {
    pub project_id: String,
    pub user_id: String,
    pub role: Role,
    pub permissions: Json<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildingMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floors: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Building {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub description: Option<String>,
    /// Storage id of the most recently uploaded model file.
    pub ifc_file_id: Option<String>,
    pub external_model_id: Option<String>,
    pub metadata: Option<Json<BuildingMetadata>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum FileStatus {
    Uploading,
    Processing,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BuildingFile {
    pub id: String,
    pub building_id: String,
    pub storage_id: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: i64,
    pub status: FileStatus,
    pub uploaded_by: String,
    pub error_message: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementDocumentation {
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BuildingElement {
    pub id: String,
    pub building_id: String,
    pub element_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub element_type: String,
    pub category: Option<String>,
    pub properties: Json<serde_json::Value>,
    pub documentation: Option<Json<Vec<ElementDocumentation>>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum IssuePriority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    InProgress,
    Resolved,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Issue {
    pub id: String,
    pub project_id: String,
    pub building_id: Option<String>,
    pub element_ids: Json<Vec<String>>,
    pub title: String,
    pub description: String,
    pub priority: IssuePriority,
    pub status: IssueStatus,
    pub assigned_to: Option<String>,
    pub created_by: String,
    pub due_date: Option<DateTime<Utc>>,
    pub attachments: Option<Json<Vec<String>>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IssueComment {
    pub id: String,
    pub issue_id: String,
    pub author_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IngestionJob {
    pub id: String,
    pub building_id: String,
    pub file_id: String,
    pub storage_id: String,
    pub status: JobStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub error_message: Option<String>,
    pub deadline_at: Option<DateTime<Utc>>,
    /// A re-queued job is not claimed before this time.
    pub not_before: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}
