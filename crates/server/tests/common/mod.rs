//! Shared harness for the HTTP integration suites.
//!
//! Each test gets its own temporary SQLite file and blob directory, a running
//! ingestion worker, and a router driven through `tower::ServiceExt::oneshot`.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use bimtrack_server::{
    app,
    config::{Config, IngestConfig},
    db::{models::FileStatus, Database},
    middleware::auth::Claims,
    services::{
        ingestion::{IngestQueue, IngestWorker, ModelParser, PlaceholderParser, WorkerHandle},
        storage::{BlobStore, LocalBlobStore},
    },
    AppState,
};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

pub const JWT_SECRET: &str = "test-secret";

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
    pub worker: WorkerHandle,
    _dir: TempDir,
}

pub fn test_ingest_config() -> IngestConfig {
    IngestConfig::default()
        .with_poll_interval(20)
        .with_simulated_delay(10)
        .with_timeout(5)
        .with_retry_backoff(10)
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with(test_ingest_config(), None).await
}

/// Start an app, optionally replacing the blob store used by the worker and handlers.
pub async fn spawn_app_with(ingest: IngestConfig, blobs: Option<Arc<dyn BlobStore>>) -> TestApp {
    spawn_app_with_parser(ingest, blobs, None).await
}

/// Like [`spawn_app_with`], also replacing the placeholder parser.
pub async fn spawn_app_with_parser(
    ingest: IngestConfig,
    blobs: Option<Arc<dyn BlobStore>>,
    parser: Option<Arc<dyn ModelParser>>,
) -> TestApp {
    let dir = TempDir::new().expect("Failed to create temp dir");

    let config = Config {
        port: 0,
        database_url: format!("sqlite:{}", dir.path().join("test.db").display()),
        database_max_connections: 5,
        storage_path: dir.path().join("blobs").display().to_string(),
        jwt_secret: JWT_SECRET.to_string(),
        upload_url_ttl_secs: 3600,
        max_upload_bytes: 1024 * 1024,
        ingest,
    };

    let db = Database::connect(&config.database_url, config.database_max_connections)
        .await
        .expect("Failed to connect to database");
    db.run_migrations().await.expect("Failed to run migrations");

    let blobs: Arc<dyn BlobStore> = match blobs {
        Some(blobs) => blobs,
        None => {
            let local = LocalBlobStore::new(&config.storage_path, config.upload_url_ttl_secs);
            local.init().await.expect("Failed to init blob store");
            Arc::new(local)
        }
    };

    let queue = IngestQueue::new(config.ingest.max_attempts);
    let parser: Arc<dyn ModelParser> = match parser {
        Some(parser) => parser,
        None => Arc::new(PlaceholderParser::new(Duration::from_millis(
            config.ingest.simulated_delay_ms,
        ))),
    };
    let worker = IngestWorker::new(
        db.clone(),
        blobs.clone(),
        parser,
        config.ingest.clone(),
        &queue,
    )
    .start();

    let state = AppState {
        db,
        config,
        blobs,
        ingest: queue,
    };

    TestApp {
        router: app(state.clone()),
        state,
        worker,
        _dir: dir,
    }
}

/// Mint a bearer token the auth middleware accepts.
pub fn token_for(user_id: &str) -> String {
    token_with_email(user_id, &format!("{user_id}@example.com"))
}

pub fn token_with_email(user_id: &str, email: &str) -> String {
    let claims = Claims {
        sub: user_id.to_string(),
        email: email.to_string(),
        name: user_id.to_string(),
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("Failed to encode token")
}

impl TestApp {
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }

        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("Failed to build request");

        self.send(request).await
    }

    pub async fn upload_bytes(&self, uri: &str, data: &'static [u8]) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from(data))
            .expect("Failed to build request");

        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Router is infallible");

        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("Failed to read body");
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

        (status, value)
    }

    pub async fn get(&self, uri: &str, token: &str) -> (StatusCode, Value) {
        self.request(Method::GET, uri, Some(token), None).await
    }

    pub async fn post(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::POST, uri, Some(token), Some(body)).await
    }

    pub async fn put(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::PUT, uri, Some(token), Some(body)).await
    }

    /// Create a project and return its id.
    pub async fn create_project(&self, token: &str, name: &str) -> String {
        let (status, body) = self
            .post("/api/projects", token, json!({ "name": name }))
            .await;
        assert_eq!(status, StatusCode::OK, "create project failed: {body}");
        body["id"].as_str().expect("project id").to_string()
    }

    /// Create a building in a project and return its id.
    pub async fn create_building(&self, token: &str, project_id: &str, name: &str) -> String {
        let (status, body) = self
            .post(
                &format!("/api/projects/{project_id}/buildings"),
                token,
                json!({ "name": name }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "create building failed: {body}");
        body["id"].as_str().expect("building id").to_string()
    }

    /// Grant `user_id` a role. The user must have made at least one request.
    pub async fn add_member(&self, owner_token: &str, project_id: &str, user_id: &str, role: &str) {
        let (status, body) = self
            .post(
                &format!("/api/projects/{project_id}/members"),
                owner_token,
                json!({ "email": format!("{user_id}@example.com"), "role": role }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "add member failed: {body}");
    }

    /// Register a user by making an authenticated request with their token.
    pub async fn sign_in(&self, user_id: &str) -> String {
        let token = token_for(user_id);
        let (status, _) = self.get("/api/projects", &token).await;
        assert_eq!(status, StatusCode::OK);
        token
    }

    /// Upload bytes through an issued upload URL and return the storage id.
    pub async fn store_blob(&self, token: &str, data: &'static [u8]) -> String {
        let (status, body) = self
            .post("/api/storage/upload-url", token, json!({}))
            .await;
        assert_eq!(status, StatusCode::OK);
        let upload_url = body["upload_url"].as_str().expect("upload url").to_string();

        let (status, body) = self.upload_bytes(&upload_url, data).await;
        assert_eq!(status, StatusCode::OK, "upload failed: {body}");
        body["storage_id"].as_str().expect("storage id").to_string()
    }

    /// Run the full upload flow and attach the blob to the building.
    /// Returns the attach response.
    pub async fn upload_model(&self, token: &str, building_id: &str) -> Value {
        self.upload_model_bytes(token, building_id, b"ISO-10303-21;\nHEADER;\nENDSEC;\n")
            .await
    }

    pub async fn upload_model_bytes(
        &self,
        token: &str,
        building_id: &str,
        data: &'static [u8],
    ) -> Value {
        let storage_id = self.store_blob(token, data).await;

        let (status, body) = self
            .put(
                &format!("/api/buildings/{building_id}/ifc"),
                token,
                json!({
                    "storage_id": storage_id,
                    "file_name": "model.ifc",
                    "file_size": data.len(),
                }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "attach failed: {body}");
        body
    }

    /// Poll until the file reaches `expected` or the timeout elapses.
    pub async fn wait_for_file_status(&self, file_id: &str, expected: FileStatus) -> bool {
        self.wait_for_file_status_within(file_id, expected, Duration::from_secs(10))
            .await
    }

    pub async fn wait_for_file_status_within(
        &self,
        file_id: &str,
        expected: FileStatus,
        limit: Duration,
    ) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            let status = sqlx::query_scalar::<_, FileStatus>(
                "SELECT status FROM building_files WHERE id = ?",
            )
            .bind(file_id)
            .fetch_optional(&self.state.db.pool)
            .await
            .expect("Failed to query file status");

            if status == Some(expected) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}
