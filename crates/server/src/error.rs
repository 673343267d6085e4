use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthenticated,

    #[error("{0}")]
    AccessDenied(String),

    #[error("{0}")]
    InsufficientPermission(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("IFC file processing failed")]
    IngestionFailure(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable kind, sent next to the message.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Unauthenticated => "unauthenticated",
            AppError::AccessDenied(_) => "access_denied",
            AppError::InsufficientPermission(_) => "insufficient_permission",
            AppError::NotFound(_) => "not_found",
            AppError::Validation(_) => "validation",
            AppError::BadRequest(_) => "bad_request",
            AppError::IngestionFailure(_) => "ingestion_failure",
            AppError::Database(_) => "database",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::AccessDenied(_) | AppError::InsufficientPermission(_) => {
                StatusCode::FORBIDDEN
            }
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::IngestionFailure(_) | AppError::Database(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Server-side failures keep their details in the log only
        let message = match &self {
            AppError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                "Internal server error".to_string()
            }
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                "Internal server error".to_string()
            }
            AppError::IngestionFailure(cause) => {
                tracing::error!(%cause, "Ingestion failure");
                self.to_string()
            }
            other => other.to_string(),
        };

        let body = Json(serde_json::json!({
            "error": message,
            "code": self.code(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AppError::AccessDenied("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::InsufficientPermission("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(AppError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::Validation("x".into()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn test_ingestion_failure_hides_cause() {
        let err = AppError::IngestionFailure("connection reset".into());
        assert_eq!(err.to_string(), "IFC file processing failed");
        assert_eq!(err.code(), "ingestion_failure");
    }

    #[tokio::test]
    async fn test_response_body_carries_message_and_code() {
        let response = AppError::NotFound("Building not found".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            body,
            serde_json::json!({ "error": "Building not found", "code": "not_found" })
        );
    }

    #[tokio::test]
    async fn test_internal_details_stay_out_of_body() {
        let response = AppError::Internal("disk full at /var/data".into()).into_response();

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Internal server error");
        assert_eq!(body["code"], "internal");
    }

    #[test]
    fn test_sqlx_error_converts() {
        let err: AppError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.code(), "database");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
