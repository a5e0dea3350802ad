//! End-to-end flow over the HTTP surface: a professional with a module/date
//! restricted grant synchronizing a patient's data.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use caresync_core::access::{AccessMode, AccessRestriction, AccessRule};
use caresync_core::projects::{ProjectDef, ProjectRegistry, TableDef};
use caresync_core::push::PushMessageData;
use caresync_core::users::{Role, User};
use caresync_push::PushGateway;
use caresync_server::main_lib::{build_state, router, AppState};
use caresync_storage_sqlite::create_in_memory_pool;

struct NoopGateway;

#[async_trait]
impl PushGateway for NoopGateway {
    async fn send_data_message(
        &self,
        _token: &str,
        _data: &PushMessageData,
    ) -> caresync_push::Result<()> {
        Ok(())
    }
}

// Sample times (unix millis, UTC).
const JAN_15_NOON: i64 = 1_705_320_000_000;
const DEC_30_NOON: i64 = 1_703_937_600_000;
const DEC_31_NOON: i64 = 1_704_024_000_000;
const FEB_01_NOON: i64 = 1_706_788_800_000;

fn registry() -> Arc<ProjectRegistry> {
    Arc::new(ProjectRegistry::new(vec![ProjectDef {
        code: "default".to_string(),
        tables: vec![TableDef {
            name: "heart_rate".to_string(),
            modules: vec!["vitals".to_string()],
            columns: vec![
                "user".to_string(),
                "bpm".to_string(),
                "sampleTime".to_string(),
            ],
            time_column: Some("sampleTime".to_string()),
        }],
    }]))
}

fn user(userid: &str, role: Role) -> User {
    User {
        userid: userid.to_string(),
        email: format!("{}@example.com", userid),
        role,
        active: true,
    }
}

async fn fixture() -> (Router, Arc<AppState>) {
    let pool = create_in_memory_pool().expect("in-memory pool");
    {
        let directory = caresync_storage_sqlite::DirectoryRepository::new(pool.clone());
        directory
            .upsert_user(&user("pat", Role::Patient), Some("pat-token"))
            .unwrap();
        directory
            .upsert_user(&user("prof", Role::Professional), Some("prof-token"))
            .unwrap();
        directory
            .add_project_user("default", "pat", Role::Patient)
            .unwrap();
        directory
            .add_project_user("default", "prof", Role::Professional)
            .unwrap();
        directory
            .set_access_rule(
                "default",
                "prof",
                "pat",
                &AccessRule {
                    restrictions: Some(vec![AccessRestriction {
                        module: "vitals".to_string(),
                        access_mode: AccessMode::ReadWrite,
                        start: Some("2024-01-01".parse().unwrap()),
                        end: None,
                    }]),
                },
            )
            .unwrap();
    }
    let state = build_state(pool, registry(), Arc::new(NoopGateway)).expect("build state");
    (router(state.clone()), state)
}

async fn send(app: &Router, token: &str, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn heart_rate_action(record: &str, seq: i64, sample_time: i64) -> Value {
    json!({
        "table": "heart_rate",
        "user": "pat",
        "kind": "insert",
        "recordId": record,
        "seq": seq,
        "payload": {
            "id": record,
            "user": "pat",
            "bpm": 64,
            "sampleTime": sample_time,
        },
    })
}

#[tokio::test]
async fn professional_sync_respects_granted_range() {
    let (app, _state) = fixture().await;

    // The patient uploads two samples, one before the granted range.
    let (status, _) = send(
        &app,
        "pat-token",
        "POST",
        "/projects/default/sync/write",
        json!({ "actions": [
            heart_rate_action("r-dec30", 1, DEC_30_NOON),
            heart_rate_action("r-jan15", 2, JAN_15_NOON),
        ]}),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // The professional reads the patient from an empty cursor and only
    // receives the sample inside the granted range.
    let (status, body) = send(
        &app,
        "prof-token",
        "POST",
        "/projects/default/sync/read",
        json!({ "subject": "pat", "maxCount": 100 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let actions = body.as_array().unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0]["recordId"], "r-jan15");

    // Stats agree with the read.
    let (status, stats) = send(
        &app,
        "prof-token",
        "POST",
        "/projects/default/sync/read-stats",
        json!({ "subject": "pat" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["count"], 1);

    // A corrected record dated before the granted range is rejected, and
    // nothing from the batch becomes visible.
    let (status, _) = send(
        &app,
        "prof-token",
        "POST",
        "/projects/default/sync/write",
        json!({ "subject": "pat", "actions": [
            heart_rate_action("r-dec31", 10, DEC_31_NOON),
        ]}),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (_, body) = send(
        &app,
        "pat-token",
        "POST",
        "/projects/default/sync/read",
        json!({ "includeOwn": true }),
    )
    .await;
    assert_eq!(body.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn own_writes_are_hidden_unless_requested() {
    let (app, _state) = fixture().await;
    let (status, _) = send(
        &app,
        "pat-token",
        "POST",
        "/projects/default/sync/write",
        json!({ "actions": [heart_rate_action("r1", 1, JAN_15_NOON)] }),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, hidden) = send(
        &app,
        "pat-token",
        "POST",
        "/projects/default/sync/read",
        json!({}),
    )
    .await;
    assert_eq!(hidden.as_array().unwrap().len(), 0);

    let (_, shown) = send(
        &app,
        "pat-token",
        "POST",
        "/projects/default/sync/read",
        json!({ "includeOwn": true }),
    )
    .await;
    assert_eq!(shown.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn watch_wakes_on_matching_write() {
    let (app, _state) = fixture().await;

    let watcher = {
        let app = app.clone();
        tokio::spawn(async move {
            send(
                &app,
                "prof-token",
                "POST",
                "/projects/default/sync/watch",
                json!({ "subject": "pat" }),
            )
            .await
        })
    };
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let (status, _) = send(
        &app,
        "pat-token",
        "POST",
        "/projects/default/sync/write",
        json!({ "actions": [heart_rate_action("r-feb", 1, FEB_01_NOON)] }),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = tokio::time::timeout(std::time::Duration::from_secs(5), watcher)
        .await
        .expect("watch did not wake in time")
        .unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resultCode"], "OK");
    assert_eq!(body["actions"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn revoked_access_denies_subsequent_reads() {
    let (app, state) = fixture().await;
    let (status, _) = send(
        &app,
        "prof-token",
        "POST",
        "/projects/default/sync/read",
        json!({ "subject": "pat" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    state
        .directory
        .remove_access_rule("default", "prof", "pat")
        .unwrap();

    let (status, _) = send(
        &app,
        "prof-token",
        "POST",
        "/projects/default/sync/read",
        json!({ "subject": "pat" }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let (app, _state) = fixture().await;
    let request = Request::builder()
        .method("POST")
        .uri("/projects/default/sync/read")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
