//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "test"
//! ems_scope: "code"
//! ems_description: "In-process ThingsBoard stand-in shared by the integration suites."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};

pub const SESSION_TOKEN: &str = "jwt-session";

#[derive(Default)]
pub struct MockState {
    /// Device name to device id.
    pub devices: HashMap<String, String>,
    pub logins: u32,
    pub created: Vec<(String, String)>,
    pub telemetry: Vec<(String, Value)>,
    pub unauthorized: u32,
}

pub type Shared = Arc<Mutex<MockState>>;

pub struct MockThingsBoard {
    pub addr: SocketAddr,
    pub state: Shared,
}

impl MockThingsBoard {
    pub async fn start() -> Self {
        let state: Shared = Arc::default();
        let app = Router::new()
            .route("/api/auth/login", post(login))
            .route("/api/tenant/devices", get(find_device))
            .route("/api/device", post(create_device))
            .route("/api/device/:id/credentials", get(credentials))
            .route("/api/v1/:token/telemetry", post(telemetry))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn telemetry(&self) -> Vec<(String, Value)> {
        self.state.lock().telemetry.clone()
    }
}

fn authorized(state: &Shared, headers: &HeaderMap) -> bool {
    let ok = headers
        .get("X-Authorization")
        .and_then(|value| value.to_str().ok())
        .map(|value| value == format!("Bearer {SESSION_TOKEN}"))
        .unwrap_or(false);
    if !ok {
        state.lock().unauthorized += 1;
    }
    ok
}

async fn login(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    if body["username"].as_str().is_none() || body["password"].as_str().is_none() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    state.lock().logins += 1;
    Json(json!({ "token": SESSION_TOKEN, "refreshToken": "refresh" })).into_response()
}

async fn find_device(
    State(state): State<Shared>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let Some(name) = query.get("deviceName") else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match state.lock().devices.get(name) {
        Some(id) => Json(json!({ "id": { "entityType": "DEVICE", "id": id }, "name": name }))
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn create_device(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let name = body["name"].as_str().unwrap_or_default().to_owned();
    let device_type = body["type"].as_str().unwrap_or_default().to_owned();
    let mut guard = state.lock();
    let id = format!("device-{}", guard.devices.len() + 1);
    guard.devices.insert(name.clone(), id.clone());
    guard.created.push((name.clone(), device_type));
    Json(json!({ "id": { "entityType": "DEVICE", "id": id }, "name": name })).into_response()
}

async fn credentials(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if !state.lock().devices.values().any(|known| *known == id) {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(json!({ "credentialsType": "ACCESS_TOKEN", "credentialsId": format!("token-{id}") }))
        .into_response()
}

async fn telemetry(
    State(state): State<Shared>,
    Path(token): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    state.lock().telemetry.push((token, body));
    StatusCode::OK
}
