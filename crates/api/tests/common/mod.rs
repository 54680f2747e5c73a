#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use stormforge_api::auth::jwt::{generate_access_token, JwtConfig};
use stormforge_api::config::{EngineConfig, ServerConfig};
use stormforge_api::engine::Orchestrator;
use stormforge_api::router::build_app_router;
use stormforge_api::state::AppState;
use stormforge_api::ws::WsManager;
use stormforge_core::job::{JobSnapshot, JobStatus};
use stormforge_core::roles::{Identity, Role};
use stormforge_core::targets::{parse_target, ListKind};
use stormforge_core::types::{DbId, JobId};
use stormforge_db::models::audit::NewAuditEntry;
use stormforge_db::models::target::NewTargetEntry;
use stormforge_db::{MemoryStore, TargetListStore};
use stormforge_events::{EventBus, JobRecorder, Recorder};

pub const ADMIN_ID: DbId = 1;
pub const OPERATOR_ID: DbId = 2;
pub const OTHER_OPERATOR_ID: DbId = 3;
pub const VIEWER_ID: DbId = 4;

const TEST_SECRET: &str = "test-secret-that-is-long-enough-for-hmac";

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
        database_url: None,
        jwt: JwtConfig {
            secret: TEST_SECRET.to_string(),
        },
    }
}

/// Engine settings tuned for fast tests: short grace periods and no
/// progress throttling.
pub fn test_engine_config(tool_path: impl Into<String>) -> EngineConfig {
    EngineConfig {
        tool_path: tool_path.into(),
        stop_grace_secs: 1,
        kill_wait_secs: 2,
        progress_interval_ms: 0,
        ..EngineConfig::default()
    }
}

/// A fully wired application over in-memory stores.
pub struct TestApp {
    pub app: Router,
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub recorder_cancel: CancellationToken,
    /// Keeps fake tool scripts alive for the duration of the test.
    pub tool_dir: Option<TempDir>,
}

impl TestApp {
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.state.orchestrator
    }

    /// A fresh clone of the router, for `oneshot`.
    pub fn router(&self) -> Router {
        self.app.clone()
    }
}

/// Build the application with `10.0.0.0/8` on the allow list and a tool
/// that does not exist (fine for dry runs and admission tests).
pub async fn build_test_app() -> TestApp {
    build_test_app_with(test_engine_config("/nonexistent/hping3"), None).await
}

/// Build the application with a fake tool script as the traffic generator.
#[cfg(unix)]
pub async fn build_test_app_with_tool(script: &str) -> TestApp {
    let (dir, path) = fake_tool(script);
    let config = test_engine_config(path.to_string_lossy().into_owned());
    build_test_app_with(config, Some(dir)).await
}

pub async fn build_test_app_with(engine_config: EngineConfig, tool_dir: Option<TempDir>) -> TestApp {
    let config = test_config();
    let store = Arc::new(MemoryStore::new());
    store
        .add_entry(NewTargetEntry {
            kind: ListKind::Allow,
            cidr: parse_target("10.0.0.0/8").unwrap(),
            description: Some("lab".into()),
            created_by: Some(ADMIN_ID),
        })
        .await
        .unwrap();

    let bus = Arc::new(EventBus::new(engine_config.subscriber_buffer));
    let (recorder, records) = Recorder::new();
    let recorder_cancel = CancellationToken::new();
    tokio::spawn(JobRecorder::run(
        store.clone(),
        records,
        recorder_cancel.clone(),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        &engine_config,
        bus,
        recorder,
        store.clone(),
        store.clone(),
        store.clone(),
    ));
    orchestrator.load().await.unwrap();

    let ws_manager = Arc::new(WsManager::with_capacity(engine_config.subscriber_buffer));
    let state = AppState {
        config: Arc::new(config.clone()),
        engine_config: Arc::new(engine_config),
        orchestrator,
        ws_manager,
        pool: None,
    };
    let app = build_app_router(state.clone(), &config);

    TestApp {
        app,
        state,
        store,
        recorder_cancel,
        tool_dir,
    }
}

/// Write an executable shell script standing in for the traffic tool.
#[cfg(unix)]
pub fn fake_tool(script: &str) -> (TempDir, PathBuf) {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fake-hping3");
    std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    (dir, path)
}

// ---------------------------------------------------------------------------
// Identities and tokens
// ---------------------------------------------------------------------------

pub fn identity(user_id: DbId, role: Role) -> Identity {
    Identity::new(user_id, role)
}

pub fn token(user_id: DbId, role: Role) -> String {
    let config = test_config();
    generate_access_token(user_id, role.as_str(), 15, &config.jwt).unwrap()
}

pub fn admin_token() -> String {
    token(ADMIN_ID, Role::Admin)
}

pub fn operator_token() -> String {
    token(OPERATOR_ID, Role::Operator)
}

pub fn viewer_token() -> String {
    token(VIEWER_ID, Role::ReadOnly)
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub async fn send(
    app: Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> Response<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    app.oneshot(request).await.unwrap()
}

/// Unauthenticated GET.
pub async fn get(app: Router, uri: &str) -> Response<Body> {
    send(app, Method::GET, uri, None, None).await
}

pub async fn get_auth(app: Router, uri: &str, token: &str) -> Response<Body> {
    send(app, Method::GET, uri, Some(token), None).await
}

pub async fn post_json(app: Router, uri: &str, token: &str, body: Value) -> Response<Body> {
    send(app, Method::POST, uri, Some(token), Some(body)).await
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Assert the status and return the parsed body.
pub async fn expect_json(response: Response<Body>, status: StatusCode) -> Value {
    let actual = response.status();
    let json = body_json(response).await;
    assert_eq!(actual, status, "unexpected status, body: {json}");
    json
}

// ---------------------------------------------------------------------------
// Job helpers
// ---------------------------------------------------------------------------

/// A minimal valid ICMP submission body.
pub fn icmp_job(duration_secs: u64) -> Value {
    json!({
        "name": "baseline",
        "targets": ["10.0.0.1"],
        "traffic_type": "icmp",
        "pps": 10,
        "duration_secs": duration_secs,
    })
}

/// Poll until the job satisfies `done`, failing the test after `timeout`.
pub async fn wait_for(
    orchestrator: &Orchestrator,
    viewer: &Identity,
    id: JobId,
    timeout: Duration,
    done: impl Fn(&JobSnapshot) -> bool,
) -> JobSnapshot {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let snapshot = orchestrator.get(viewer, id).unwrap();
        if done(&snapshot) {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for job {id}, last status {}",
            snapshot.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_for_status(
    orchestrator: &Orchestrator,
    viewer: &Identity,
    id: JobId,
    status: JobStatus,
) -> JobSnapshot {
    wait_for(orchestrator, viewer, id, Duration::from_secs(15), |s| s.status == status).await
}

pub async fn wait_for_terminal(
    orchestrator: &Orchestrator,
    viewer: &Identity,
    id: JobId,
) -> JobSnapshot {
    wait_for(orchestrator, viewer, id, Duration::from_secs(15), |s| {
        s.status.is_terminal()
    })
    .await
}

/// Poll until the recorder has written an audit entry for `action`.
///
/// Audit rows go through the background recorder, so they land some time
/// after the request that caused them returns.
pub async fn wait_for_audit(store: &MemoryStore, action: &str) -> NewAuditEntry {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(entry) = store.audit_entries().into_iter().find(|e| e.action == action) {
            return entry;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for audit entry {action}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
