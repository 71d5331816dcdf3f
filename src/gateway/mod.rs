//! Axum-based HTTP gateway with body limits and timeouts.
//!
//! - `/health` is public.
//! - `/app/*` routes sit behind [`user_session`], the activation hook: Basic
//!   credentials are checked against the user repository and a session is
//!   activated and attached to the request.
//! - `/admin/*` routes sit behind admin Basic credentials from config and
//!   answer 503 when none are configured.

use crate::config::Config;
use crate::error::{SessionError, UserId};
use crate::session::{Session, SessionManager};
use crate::users::store::constant_time_eq;
use crate::users::{User, UserRepository, UserUpdate};
use anyhow::Result;
use axum::{
    extract::{Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Extension, Router,
};
use base64::Engine as _;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB).
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout (60s); pairing waits must finish well inside it.
pub const REQUEST_TIMEOUT_SECS: u64 = 60;

type ApiResponse = (StatusCode, Json<serde_json::Value>);

/// Admin login; the password is kept only as a SHA-256 digest.
pub struct AdminCredentials {
    username: String,
    password_hash: String,
}

impl AdminCredentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password_hash: hash_secret(password),
        }
    }

    fn matches(&self, username: &str, password: &str) -> bool {
        let user_ok = constant_time_eq(self.username.as_bytes(), username.as_bytes());
        let pass_ok = constant_time_eq(self.password_hash.as_bytes(), hash_secret(password).as_bytes());
        user_ok && pass_ok
    }
}

fn hash_secret(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Shared state for all axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub users: Arc<dyn UserRepository>,
    pub admin: Option<Arc<AdminCredentials>>,
}

/// Authenticated user plus their activated session, attached by [`user_session`].
#[derive(Clone)]
pub struct ActiveSession {
    pub user: User,
    pub session: Arc<Session>,
}

/// Build the router with all routes and layers.
pub fn router(state: AppState) -> Router {
    let app_routes = Router::new()
        .route("/app/status", get(handle_app_status))
        .route("/app/login", get(handle_app_login))
        .route("/app/reconnect", post(handle_app_reconnect))
        .route("/app/logout", post(handle_app_logout))
        .route_layer(middleware::from_fn_with_state(state.clone(), user_session));

    let admin_routes = Router::new()
        .route(
            "/admin/users",
            get(handle_admin_users_list).post(handle_admin_user_create),
        )
        .route(
            "/admin/users/{id}",
            put(handle_admin_user_update).delete(handle_admin_user_delete),
        )
        .route("/admin/users/{id}/status", get(handle_admin_user_status))
        .route(
            "/admin/users/{id}/session/{action}",
            post(handle_admin_session_action),
        )
        .route("/admin/sessions", get(handle_admin_sessions_list))
        .route_layer(middleware::from_fn_with_state(state.clone(), admin_auth));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .merge(app_routes)
        .merge(admin_routes)
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

/// Bind and serve until `shutdown` is cancelled.
pub async fn run_gateway(config: &Config, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    tracing::info!(
        addr = %local,
        admin = state.admin.is_some(),
        "Gateway listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    tracing::info!("Gateway stopped");
    Ok(())
}

// ── Auth ────────────────────────────────────────────────────────────

fn error_json(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    (status, Json(serde_json::json!({"error": message.into()})))
}

/// Map a session error to a distinguishable HTTP status.
pub fn session_error_status(err: &SessionError) -> StatusCode {
    match err {
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        SessionError::AlreadyLoggedIn(_) => StatusCode::CONFLICT,
        SessionError::NotInitialized(_) | SessionError::Storage { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        SessionError::Transport { .. } => StatusCode::BAD_GATEWAY,
        SessionError::PairingTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
    }
}

fn session_error_response(err: &SessionError) -> ApiResponse {
    let status = session_error_status(err);
    if status.is_server_error() {
        tracing::warn!(user_id = err.user_id(), kind = err.kind(), "Session operation failed: {err}");
    }
    (
        status,
        Json(serde_json::json!({
            "error": err.to_string(),
            "kind": err.kind(),
        })),
    )
}

/// Decode `Authorization: Basic base64(user:pass)`.
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let encoded = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?
        .strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn unauthorized(message: &str) -> Response {
    let mut response = error_json(StatusCode::UNAUTHORIZED, message).into_response();
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        header::HeaderValue::from_static("Basic realm=\"whatsmux\""),
    );
    response
}

/// Resolve credentials to a user and activate that user's session.
fn authenticate_user(state: &AppState, headers: &HeaderMap) -> Result<ActiveSession, Response> {
    let Some((username, password)) = basic_credentials(headers) else {
        return Err(unauthorized("Missing or malformed Basic credentials"));
    };

    let user = match state.users.validate_credentials(&username, &password) {
        Ok(Some(user)) => user,
        Ok(None) => {
            tracing::debug!(username = %username, "Rejected user credentials");
            return Err(unauthorized("Invalid username or password"));
        }
        Err(e) => {
            tracing::error!("User lookup failed: {e:#}");
            return Err(
                error_json(StatusCode::INTERNAL_SERVER_ERROR, "User lookup failed").into_response(),
            );
        }
    };

    let session = state
        .manager
        .activate_session(user.id, &user.username)
        .map_err(|e| session_error_response(&e).into_response())?;
    Ok(ActiveSession { user, session })
}

/// Activation hook: authenticate, ensure a session exists, attach it.
pub async fn user_session(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    match authenticate_user(&state, req.headers()) {
        Ok(active) => {
            req.extensions_mut().insert(active);
            next.run(req).await
        }
        Err(response) => response,
    }
}

async fn admin_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(admin) = state.admin.as_ref() else {
        return error_json(StatusCode::SERVICE_UNAVAILABLE, "Admin access not configured")
            .into_response();
    };
    match basic_credentials(req.headers()) {
        Some((user, pass)) if admin.matches(&user, &pass) => next.run(req).await,
        _ => unauthorized("admin authentication required"),
    }
}

// ── Views ───────────────────────────────────────────────────────────

fn status_json(manager: &SessionManager, user_id: UserId) -> serde_json::Value {
    let present = manager.registry().get(user_id).is_some();
    let status = manager.query_status(user_id);
    serde_json::json!({
        "session": present,
        "status": status.label(),
        "is_connected": status.is_connected,
        "is_logged_in": status.is_logged_in,
        "device_id": status.device_id,
    })
}

fn user_json(manager: &SessionManager, user: &User) -> serde_json::Value {
    serde_json::json!({
        "id": user.id,
        "username": user.username,
        "is_active": user.is_active,
        "created_at": user.created_at,
        "updated_at": user.updated_at,
        "session": status_json(manager, user.id),
    })
}

// ── Handlers ────────────────────────────────────────────────────────

/// GET /health
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.manager.registry().len(),
    }))
}

/// GET /app/status
async fn handle_app_status(
    State(state): State<AppState>,
    Extension(active): Extension<ActiveSession>,
) -> ApiResponse {
    (
        StatusCode::OK,
        Json(user_json(&state.manager, &active.user)),
    )
}

/// GET /app/login: start pairing and return the pairing code.
async fn handle_app_login(
    State(state): State<AppState>,
    Extension(active): Extension<ActiveSession>,
) -> ApiResponse {
    match state
        .manager
        .begin_pairing(active.user.id, &active.user.username)
        .await
    {
        Ok(code) => (StatusCode::OK, Json(serde_json::json!(code))),
        Err(e) => session_error_response(&e),
    }
}

/// POST /app/reconnect
async fn handle_app_reconnect(
    State(state): State<AppState>,
    Extension(active): Extension<ActiveSession>,
) -> ApiResponse {
    match state.manager.manual_reconnect(active.session.user_id()).await {
        Ok(()) => (StatusCode::OK, Json(status_json(&state.manager, active.user.id))),
        Err(e) => session_error_response(&e),
    }
}

/// POST /app/logout
async fn handle_app_logout(
    State(state): State<AppState>,
    Extension(active): Extension<ActiveSession>,
) -> ApiResponse {
    match state.manager.logout(active.user.id).await {
        Ok(report) => (StatusCode::OK, Json(serde_json::json!(report))),
        Err(e) => session_error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct CreateUserBody {
    username: String,
    password: String,
}

/// GET /admin/users
async fn handle_admin_users_list(State(state): State<AppState>) -> ApiResponse {
    match state.users.get_all() {
        Ok(users) => {
            let list: Vec<_> = users.iter().map(|u| user_json(&state.manager, u)).collect();
            (StatusCode::OK, Json(serde_json::json!({"users": list})))
        }
        Err(e) => error_json(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")),
    }
}

/// POST /admin/users
async fn handle_admin_user_create(
    State(state): State<AppState>,
    body: Result<Json<CreateUserBody>, axum::extract::rejection::JsonRejection>,
) -> ApiResponse {
    let Json(body) = match body {
        Ok(body) => body,
        Err(e) => return error_json(StatusCode::BAD_REQUEST, format!("Invalid request: {e}")),
    };
    match state.users.create(&body.username, &body.password) {
        Ok(user) => (StatusCode::CREATED, Json(user_json(&state.manager, &user))),
        Err(e) => error_json(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

fn find_user(state: &AppState, id: UserId) -> Result<User, ApiResponse> {
    match state.users.get_by_id(id) {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(error_json(StatusCode::NOT_FOUND, format!("User {id} not found"))),
        Err(e) => Err(error_json(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))),
    }
}

/// PUT /admin/users/{id}
async fn handle_admin_user_update(
    State(state): State<AppState>,
    Path(id): Path<UserId>,
    body: Result<Json<UserUpdate>, axum::extract::rejection::JsonRejection>,
) -> ApiResponse {
    let Json(update) = match body {
        Ok(body) => body,
        Err(e) => return error_json(StatusCode::BAD_REQUEST, format!("Invalid request: {e}")),
    };
    if let Err(resp) = find_user(&state, id) {
        return resp;
    }
    match state.users.update(id, &update) {
        Ok(user) => (StatusCode::OK, Json(user_json(&state.manager, &user))),
        Err(e) => error_json(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

/// DELETE /admin/users/{id}: clears any live session before deleting.
async fn handle_admin_user_delete(
    State(state): State<AppState>,
    Path(id): Path<UserId>,
) -> ApiResponse {
    if let Err(resp) = find_user(&state, id) {
        return resp;
    }

    let cleared = match state.manager.hard_clear(id).await {
        Ok(report) => Some(report),
        Err(SessionError::NotFound(_)) => None,
        Err(e) => return session_error_response(&e),
    };

    match state.users.delete(id) {
        Ok(true) => (
            StatusCode::OK,
            Json(serde_json::json!({"deleted": id, "session_cleared": cleared})),
        ),
        Ok(false) => error_json(StatusCode::NOT_FOUND, format!("User {id} not found")),
        Err(e) => error_json(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")),
    }
}

/// GET /admin/users/{id}/status
async fn handle_admin_user_status(
    State(state): State<AppState>,
    Path(id): Path<UserId>,
) -> ApiResponse {
    match find_user(&state, id) {
        Ok(user) => (StatusCode::OK, Json(user_json(&state.manager, &user))),
        Err(resp) => resp,
    }
}

/// GET /admin/sessions
async fn handle_admin_sessions_list(State(state): State<AppState>) -> ApiResponse {
    let mut sessions: Vec<_> = state.manager.list_active().into_values().collect();
    sessions.sort_by_key(|s| s.user_id());
    let list: Vec<_> = sessions
        .iter()
        .map(|s| {
            let mut view = status_json(&state.manager, s.user_id());
            view["user_id"] = serde_json::json!(s.user_id());
            view["username"] = serde_json::json!(s.username());
            view["created_at"] = serde_json::json!(s.created_at());
            view
        })
        .collect();
    (
        StatusCode::OK,
        Json(serde_json::json!({"count": list.len(), "sessions": list})),
    )
}

/// POST /admin/users/{id}/session/{reconnect|disconnect|clear}
async fn handle_admin_session_action(
    State(state): State<AppState>,
    Path((id, action)): Path<(UserId, String)>,
) -> ApiResponse {
    let result = match action.as_str() {
        "reconnect" => state
            .manager
            .manual_reconnect(id)
            .await
            .map(|()| status_json(&state.manager, id)),
        "disconnect" => state
            .manager
            .soft_disconnect(id)
            .await
            .map(|()| status_json(&state.manager, id)),
        "clear" => state
            .manager
            .hard_clear(id)
            .await
            .map(|report| serde_json::json!(report)),
        other => {
            return error_json(StatusCode::NOT_FOUND, format!("Unknown session action '{other}'"));
        }
    };

    match result {
        Ok(body) => {
            tracing::info!(user_id = id, action = %action, "Admin session action");
            (StatusCode::OK, Json(body))
        }
        Err(e) => session_error_response(&e),
    }
}
