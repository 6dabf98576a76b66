//! In-process stand-in for the platform's open API, served over real HTTP.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use accord_core::config::{AppConfig, EempConfig};

#[derive(Default)]
struct FakeState {
    token_requests: usize,
    calls: Vec<(String, Value)>,
    instances: HashMap<String, (String, String)>,
    next_instance: usize,
    create_error: Option<(i64, String)>,
}

#[derive(Clone, Default)]
pub(crate) struct FakePlatform {
    state: Arc<Mutex<FakeState>>,
}

impl FakePlatform {
    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    pub(crate) fn token_requests(&self) -> usize {
        self.with_state(|state| state.token_requests)
    }

    pub(crate) fn calls(&self, path: &str) -> Vec<Value> {
        self.with_state(|state| {
            state
                .calls
                .iter()
                .filter(|(called, _)| called == path)
                .map(|(_, body)| body.clone())
                .collect()
        })
    }

    pub(crate) fn set_instance(&self, instance_id: &str, status: &str, result: &str) {
        let entry = (status.to_string(), result.to_string());
        self.with_state(|state| state.instances.insert(instance_id.to_string(), entry));
    }

    pub(crate) fn fail_create_with(&self, code: i64, message: &str) {
        self.with_state(|state| state.create_error = Some((code, message.to_string())));
    }

    fn record(&self, path: &str, body: Value) {
        self.with_state(|state| state.calls.push((path.to_string(), body)));
    }

    pub(crate) async fn serve(&self) -> SocketAddr {
        self.serve_at(SocketAddr::from(([127, 0, 0, 1], 0))).await
    }

    /// Serves on a fixed address, e.g. one that was unreachable a moment ago.
    pub(crate) async fn serve_at(&self, addr: SocketAddr) -> SocketAddr {
        let app = Router::new()
            .route("/gettoken", get(token))
            .route("/topapi/processinstance/create", post(create))
            .route("/topapi/process/instance/comment/add", post(comment))
            .route("/topapi/process/instance/terminate", post(terminate))
            .route("/topapi/processinstance/get", post(instance))
            .route("/topapi/message/corpconversation/asyncsend_v2", post(message))
            .with_state(self.clone());

        let listener = tokio::net::TcpListener::bind(addr).await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }
}

/// Platform settings pointed at `base_url`, valid for validation.
pub(crate) fn eemp_config(base_url: &str) -> EempConfig {
    let mut config = AppConfig::default().eemp;
    config.enabled = true;
    config.base_url = base_url.to_string();
    config.app_key = "ding-app".to_string();
    config.app_secret = "app-secret".to_string().into();
    config.template_id = "PROC-QUOTE".to_string();
    config.callback_token = "cb-token".to_string().into();
    config.aes_key = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFE".to_string().into();
    config.receiver_id = "ding-app".to_string();
    config.approver_id = Some("manager-1".to_string());
    config.request_timeout_secs = 5;
    config
}

async fn token(State(platform): State<FakePlatform>) -> Json<Value> {
    let issued = platform.with_state(|state| {
        state.token_requests += 1;
        state.token_requests
    });
    Json(json!({
        "errcode": 0,
        "errmsg": "ok",
        "access_token": format!("tok-{issued}"),
        "expires_in": 7200,
    }))
}

async fn create(State(platform): State<FakePlatform>, Json(body): Json<Value>) -> Json<Value> {
    platform.record("create", body);
    let outcome = platform.with_state(|state| {
        if let Some((code, message)) = state.create_error.clone() {
            return Err((code, message));
        }
        state.next_instance += 1;
        let id = format!("PI-{}", state.next_instance);
        state.instances.insert(id.clone(), ("RUNNING".to_string(), String::new()));
        Ok(id)
    });
    match outcome {
        Ok(id) => Json(json!({ "errcode": 0, "process_instance_id": id })),
        Err((code, message)) => Json(json!({ "errcode": code, "errmsg": message })),
    }
}

async fn comment(State(platform): State<FakePlatform>, Json(body): Json<Value>) -> Json<Value> {
    platform.record("comment", body);
    Json(json!({ "errcode": 0, "result": true }))
}

async fn terminate(State(platform): State<FakePlatform>, Json(body): Json<Value>) -> Json<Value> {
    let instance_id =
        body["request"]["process_instance_id"].as_str().unwrap_or_default().to_string();
    platform.record("terminate", body);
    platform.set_instance(&instance_id, "TERMINATED", "");
    Json(json!({ "errcode": 0, "result": true }))
}

async fn instance(State(platform): State<FakePlatform>, Json(body): Json<Value>) -> Json<Value> {
    let instance_id = body["process_instance_id"].as_str().unwrap_or_default().to_string();
    platform.record("get", body);
    match platform.with_state(|state| state.instances.get(&instance_id).cloned()) {
        Some((status, result)) => Json(json!({
            "errcode": 0,
            "process_instance": { "status": status, "result": result },
        })),
        None => Json(json!({ "errcode": 88, "errmsg": "instance not found" })),
    }
}

async fn message(State(platform): State<FakePlatform>, Json(body): Json<Value>) -> Json<Value> {
    platform.record("message", body);
    Json(json!({ "errcode": 0, "task_id": 1 }))
}
