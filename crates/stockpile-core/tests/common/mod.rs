//! In-process mock of the inventory backend.
//!
//! Binds an axum router to an ephemeral port and counts every call to the
//! `/auth/*` endpoints so tests can assert on network behaviour.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use stockpile_core::auth::{decode_expiry, MemoryStorage, SessionStorage};
use stockpile_core::{ApiClient, RequestGate, SessionConfig, SessionEvent, SessionStore};

/// Build an unsigned JWT whose `exp` is `ttl_secs` from now.
pub fn jwt(tag: &str, ttl_secs: i64) -> String {
    let exp = Utc::now().timestamp() + ttl_secs;
    format!(
        "{}.{}.sig",
        URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(json!({ "sub": tag, "exp": exp }).to_string())
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    Succeed,
    Expired,
    Transient,
}

pub struct MockState {
    pub login_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
    pub register_calls: AtomicUsize,
    pub always_expired_calls: AtomicUsize,
    /// Bearer headers seen on `/auth/*`; must stay empty
    pub auth_endpoint_bearers: AtomicUsize,
    pub refresh_tokens_seen: Mutex<Vec<String>>,
    /// Bearer tokens seen on `/inventory`, in arrival order
    pub inventory_bearers: Mutex<Vec<Option<String>>>,
    /// Access token `/inventory` accepts (it must also be unexpired)
    pub valid_access: Mutex<String>,
    pub login_access: Mutex<String>,
    pub next_access: Mutex<String>,
    pub rotated_refresh: Mutex<Option<String>>,
    pub refresh_mode: Mutex<RefreshMode>,
    pub refresh_delay: Mutex<Duration>,
    pub logout_delay: Mutex<Duration>,
}

impl MockState {
    fn new() -> Self {
        Self {
            login_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            register_calls: AtomicUsize::new(0),
            always_expired_calls: AtomicUsize::new(0),
            auth_endpoint_bearers: AtomicUsize::new(0),
            refresh_tokens_seen: Mutex::new(Vec::new()),
            inventory_bearers: Mutex::new(Vec::new()),
            valid_access: Mutex::new(String::new()),
            login_access: Mutex::new(jwt("login", 300)),
            next_access: Mutex::new(jwt("refreshed", 300)),
            rotated_refresh: Mutex::new(None),
            refresh_mode: Mutex::new(RefreshMode::Succeed),
            refresh_delay: Mutex::new(Duration::ZERO),
            logout_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn logins(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn logouts(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }

    pub fn set_login_access(&self, token: String) {
        *self.login_access.lock().unwrap() = token;
    }

    pub fn set_next_access(&self, token: String) {
        *self.next_access.lock().unwrap() = token;
    }

    /// Make the server reject whatever access token the client holds
    pub fn revoke_access(&self) {
        *self.valid_access.lock().unwrap() = String::new();
    }

    pub fn set_refresh_mode(&self, mode: RefreshMode) {
        *self.refresh_mode.lock().unwrap() = mode;
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock().unwrap() = delay;
    }

    pub fn set_logout_delay(&self, delay: Duration) {
        *self.logout_delay.lock().unwrap() = delay;
    }

    pub fn rotate_refresh_to(&self, token: &str) {
        *self.rotated_refresh.lock().unwrap() = Some(token.to_string());
    }

    pub fn inventory_bearers(&self) -> Vec<Option<String>> {
        self.inventory_bearers.lock().unwrap().clone()
    }
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn note_auth_endpoint(state: &MockState, headers: &HeaderMap) {
    if headers.contains_key("authorization") {
        state.auth_endpoint_bearers.fetch_add(1, Ordering::SeqCst);
    }
}

async fn login(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    note_auth_endpoint(&state, &headers);
    state.login_calls.fetch_add(1, Ordering::SeqCst);

    let username = body["username"].as_str().unwrap_or_default();
    let password = body["password"].as_str().unwrap_or_default();

    match (username, password) {
        ("alice", "pw") | ("root", "pw") => {
            let access = state.login_access.lock().unwrap().clone();
            *state.valid_access.lock().unwrap() = access.clone();
            let role = if username == "root" { "admin" } else { "user" };
            (
                StatusCode::OK,
                Json(json!({
                    "status": "success",
                    "accessToken": access,
                    "refreshToken": "r1",
                    "user": { "id": "1", "username": username, "role": role }
                })),
            )
        }
        ("expired", _) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "code": "TOKEN_EXPIRED", "message": "jwt expired" })),
        ),
        ("soft-fail", _) => (
            StatusCode::OK,
            Json(json!({ "status": "error", "message": "Account locked" })),
        ),
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "status": "error", "message": "Invalid credentials" })),
        ),
    }
}

async fn refresh(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    note_auth_endpoint(&state, &headers);
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let token = body["refreshToken"].as_str().unwrap_or_default().to_string();
    state.refresh_tokens_seen.lock().unwrap().push(token);

    let delay = *state.refresh_delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let mode = *state.refresh_mode.lock().unwrap();
    match mode {
        RefreshMode::Succeed => {
            let access = state.next_access.lock().unwrap().clone();
            *state.valid_access.lock().unwrap() = access.clone();
            let mut response = json!({ "status": "success", "accessToken": access });
            if let Some(rotated) = state.rotated_refresh.lock().unwrap().clone() {
                response["refreshToken"] = json!(rotated);
            }
            (StatusCode::OK, Json(response))
        }
        RefreshMode::Expired => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "code": "REFRESH_TOKEN_EXPIRED", "message": "refresh token expired" })),
        ),
        RefreshMode::Transient => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "message": "database unavailable" })),
        ),
    }
}

async fn logout(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Json<Value> {
    note_auth_endpoint(&state, &headers);
    state.logout_calls.fetch_add(1, Ordering::SeqCst);
    let delay = *state.logout_delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    Json(json!({ "status": "success" }))
}

async fn register(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    note_auth_endpoint(&state, &headers);
    state.register_calls.fetch_add(1, Ordering::SeqCst);
    if body["username"] == "taken" {
        (
            StatusCode::CONFLICT,
            Json(json!({ "status": "error", "message": "Username already exists" })),
        )
    } else {
        (StatusCode::CREATED, Json(json!({ "status": "success" })))
    }
}

async fn inventory(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    let token = bearer(&headers);
    state.inventory_bearers.lock().unwrap().push(token.clone());

    let Some(token) = token else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "code": "NO_TOKEN", "message": "Missing token" })),
        );
    };

    let accepted = *state.valid_access.lock().unwrap() == token
        && decode_expiry(&token).map(|exp| exp > Utc::now()).unwrap_or(false);
    if accepted {
        (
            StatusCode::OK,
            Json(json!([{ "id": 1, "name": "Widget", "quantity": 12 }])),
        )
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "code": "TOKEN_EXPIRED", "message": "jwt expired" })),
        )
    }
}

async fn audit() -> (StatusCode, Json<Value>) {
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "code": "FORBIDDEN", "message": "Admin only" })),
    )
}

async fn wrong_permissions() -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "code": "INSUFFICIENT_PERMISSIONS", "message": "Not allowed" })),
    )
}

async fn always_expired(State(state): State<Arc<MockState>>) -> (StatusCode, Json<Value>) {
    state.always_expired_calls.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "code": "TOKEN_EXPIRED", "message": "jwt expired" })),
    )
}

async fn broken() -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "message": "stock table locked" })),
    )
}

pub struct MockBackend {
    pub base_url: String,
    pub state: Arc<MockState>,
    handle: JoinHandle<()>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::new());
        let app = Router::new()
            .route("/api/auth/login", post(login))
            .route("/api/auth/refresh-token", post(refresh))
            .route("/api/auth/logout", post(logout))
            .route("/api/auth/register", post(register))
            .route("/api/inventory", get(inventory))
            .route("/api/audit", get(audit))
            .route("/api/locations", get(wrong_permissions))
            .route("/api/always-expired", get(always_expired))
            .route("/api/broken", get(broken))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock backend");
        let addr = listener.local_addr().expect("local addr");
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            base_url: format!("http://{}/api", addr),
            state,
            handle,
        }
    }

    pub fn api(&self) -> ApiClient {
        ApiClient::new(self.base_url.clone(), Duration::from_secs(5)).expect("api client")
    }

    /// Store with the pre-emptive timer disabled, so only failed calls refresh
    pub fn store(&self) -> SessionStore {
        self.store_with(Arc::new(MemoryStorage::new()), quiet_config())
    }

    pub fn store_with(&self, storage: Arc<dyn SessionStorage>, config: SessionConfig) -> SessionStore {
        SessionStore::new(self.api(), storage, config)
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn quiet_config() -> SessionConfig {
    SessionConfig {
        preemptive_refresh: false,
        logout_guard: Duration::from_millis(100),
        ..SessionConfig::default()
    }
}

pub fn gate(store: &SessionStore) -> RequestGate {
    RequestGate::new(store.clone())
}

/// Collect every event currently buffered on the receiver
pub fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn count(events: &[SessionEvent], wanted: &SessionEvent) -> usize {
    events.iter().filter(|e| *e == wanted).count()
}
