//! Integration tests for issue tracking and comments.

mod common;

use axum::http::StatusCode;
use common::{spawn_app, token_for, TestApp};
use serde_json::{json, Value};

async fn create_issue(app: &TestApp, token: &str, project_id: &str, body: Value) -> Value {
    let (status, body) = app
        .post(&format!("/api/projects/{project_id}/issues"), token, body)
        .await;
    assert_eq!(status, StatusCode::OK, "create issue failed: {body}");
    body
}

#[tokio::test]
async fn test_create_and_list_issues() {
    let app = spawn_app().await;
    let alice = token_for("alice");
    let bob = app.sign_in("bob").await;

    let project_id = app.create_project(&alice, "Harbour").await;
    let building_id = app.create_building(&alice, &project_id, "A").await;
    app.add_member(&alice, &project_id, "bob", "contractor").await;

    let issue = create_issue(
        &app,
        &alice,
        &project_id,
        json!({
            "title": "Door clashes with duct",
            "description": "Level 3 corridor",
            "priority": "high",
            "building_id": building_id,
            "element_ids": ["door_001"],
            "assigned_to": "bob",
            "due_date": "2025-09-01T00:00:00Z",
        }),
    )
    .await;

    assert_eq!(issue["status"], "open");
    assert_eq!(issue["priority"], "high");
    assert_eq!(issue["element_ids"], json!(["door_001"]));
    assert_eq!(issue["creator"], json!({ "name": "alice", "email": "alice@example.com" }));
    assert_eq!(issue["assignee"]["email"], "bob@example.com");
    assert_eq!(issue["comments"], json!([]));

    let (status, body) = app
        .get(&format!("/api/projects/{project_id}/issues"), &bob)
        .await;
    assert_eq!(status, StatusCode::OK);
    let issues = body["issues"].as_array().expect("issues array");
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0]["title"], "Door clashes with duct");
    assert_eq!(issues[0]["building_id"], building_id.as_str());
}

#[tokio::test]
async fn test_create_issue_validation() {
    let app = spawn_app().await;
    let alice = token_for("alice");
    let mallory = token_for("mallory");

    let project_id = app.create_project(&alice, "Harbour").await;
    let other_project = app.create_project(&alice, "Elsewhere").await;
    let foreign_building = app.create_building(&alice, &other_project, "X").await;
    let uri = format!("/api/projects/{project_id}/issues");

    let (status, _) = app
        .post(&uri, &alice, json!({ "title": "", "priority": "low" }))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, body) = app
        .post(
            &uri,
            &alice,
            json!({ "title": "Wrong building", "priority": "low", "building_id": foreign_building }),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "Building does not belong to this project");

    let (status, _) = app
        .post(&uri, &mallory, json!({ "title": "Snooping", "priority": "low" }))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_issue_status_permissions() {
    let app = spawn_app().await;
    let alice = token_for("alice");
    let bob = app.sign_in("bob").await;
    let carol = app.sign_in("carol").await;
    let dave = app.sign_in("dave").await;

    let project_id = app.create_project(&alice, "Harbour").await;
    app.add_member(&alice, &project_id, "bob", "engineer").await;
    app.add_member(&alice, &project_id, "carol", "admin").await;
    app.add_member(&alice, &project_id, "dave", "engineer").await;

    // Created by bob, assigned to dave
    let issue = create_issue(
        &app,
        &bob,
        &project_id,
        json!({ "title": "Leak", "priority": "critical", "assigned_to": "dave" }),
    )
    .await;
    let uri = format!("/api/issues/{}/status", issue["id"].as_str().expect("issue id"));

    let (status, body) = app.put(&uri, &bob, json!({ "status": "in_progress" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "in_progress");

    let (status, _) = app.put(&uri, &dave, json!({ "status": "resolved" })).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.put(&uri, &carol, json!({ "status": "closed" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "closed");

    // A second issue where dave is neither creator nor assignee
    let other = create_issue(
        &app,
        &bob,
        &project_id,
        json!({ "title": "Crack", "priority": "medium" }),
    )
    .await;
    let (status, body) = app
        .put(
            &format!("/api/issues/{}/status", other["id"].as_str().expect("issue id")),
            &dave,
            json!({ "status": "closed" }),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "insufficient_permission");

    let (status, _) = app
        .put("/api/issues/missing/status", &alice, json!({ "status": "closed" }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_comments_are_appended_in_order() {
    let app = spawn_app().await;
    let alice = token_for("alice");
    let bob = app.sign_in("bob").await;
    let mallory = token_for("mallory");

    let project_id = app.create_project(&alice, "Harbour").await;
    app.add_member(&alice, &project_id, "bob", "viewer").await;

    let issue = create_issue(
        &app,
        &alice,
        &project_id,
        json!({ "title": "Leak", "priority": "low" }),
    )
    .await;
    let uri = format!("/api/issues/{}/comments", issue["id"].as_str().expect("issue id"));

    let (status, _) = app.post(&uri, &alice, json!({ "content": "First" })).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.post(&uri, &bob, json!({ "content": "Second" })).await;
    assert_eq!(status, StatusCode::OK);
    let comments = body["comments"].as_array().expect("comments array");
    assert_eq!(comments.len(), 2);
    assert_eq!(comments[0]["content"], "First");
    assert_eq!(comments[1]["content"], "Second");
    assert_eq!(comments[1]["author_id"], "bob");
    assert_eq!(comments[1]["author_name"], "bob");

    let (status, _) = app.post(&uri, &alice, json!({ "content": "  " })).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = app.post(&uri, &mallory, json!({ "content": "Hi" })).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .post("/api/issues/missing/comments", &alice, json!({ "content": "Hi" }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_concurrent_comments_both_persist() {
    let app = spawn_app().await;
    let alice = token_for("alice");
    let bob = app.sign_in("bob").await;

    let project_id = app.create_project(&alice, "Harbour").await;
    app.add_member(&alice, &project_id, "bob", "engineer").await;

    let issue = create_issue(
        &app,
        &alice,
        &project_id,
        json!({ "title": "Leak", "priority": "low" }),
    )
    .await;
    let uri = format!("/api/issues/{}/comments", issue["id"].as_str().expect("issue id"));

    let ((first, _), (second, _)) = futures::join!(
        app.post(&uri, &alice, json!({ "content": "From alice" })),
        app.post(&uri, &bob, json!({ "content": "From bob" })),
    );
    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::OK);

    let (_, body) = app
        .get(&format!("/api/projects/{project_id}/issues"), &alice)
        .await;
    let comments = body["issues"][0]["comments"]
        .as_array()
        .expect("comments array");
    assert_eq!(comments.len(), 2);

    let mut contents: Vec<_> = comments
        .iter()
        .map(|c| c["content"].as_str().expect("content"))
        .collect();
    contents.sort_unstable();
    assert_eq!(contents, vec!["From alice", "From bob"]);
}
