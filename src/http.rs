//! HTTP Transport Edge
//!
//! The REST surface of the relay: registration, challenge login, the key
//! directory, the message relay, the file collaborator, health, and
//! metrics. All responses share the `{success, data?, error?, message?}`
//! envelope.
//!
//! Authentication failures of every kind render the same body and status,
//! so the API cannot be probed for which users exist or which step of a
//! login failed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, DefaultBodyLimit, Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use crate::auth::{AuthEngine, AuthError};
use crate::file_store::FileStore;
use crate::identity;
use crate::key_directory::{DirectoryError, KeyDirectory, OneTimePreKeyUpload};
use crate::metrics::RelayMetrics;
use crate::rate_limit::RateLimiter;
use crate::relay::{RelayEngine, RelayError, MAX_FETCH_LIMIT};
use crate::store::{MessageType, Store, StoreError, UserRecord};
use crate::token::TokenClaims;

/// JSON bodies above this are rejected outright.
pub const BODY_LIMIT: usize = 10 * 1024 * 1024;

const MAX_USERNAME_LEN: usize = 64;

/// Per-IP rate windows, one limiter per route group.
pub struct RateLimiters {
    pub challenge: RateLimiter,
    pub verify: RateLimiter,
    pub logout: RateLimiter,
    pub api: RateLimiter,
    pub files: RateLimiter,
}

impl Default for RateLimiters {
    fn default() -> Self {
        RateLimiters {
            challenge: RateLimiter::per_minute(10),
            verify: RateLimiter::per_minute(5),
            logout: RateLimiter::per_minute(10),
            api: RateLimiter::new(300, Duration::from_secs(15 * 60)),
            files: RateLimiter::new(100, Duration::from_secs(15 * 60)),
        }
    }
}

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthEngine>,
    pub directory: Arc<KeyDirectory>,
    pub relay: Arc<RelayEngine>,
    pub store: Arc<Store>,
    pub files: Arc<dyn FileStore>,
    pub metrics: RelayMetrics,
    pub limiters: Arc<RateLimiters>,
    pub metrics_token: Option<String>,
    pub started_at: Instant,
}

// ============================================================================
// Envelope and errors
// ============================================================================

fn envelope_ok(data: Value) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

/// Error kinds the edge renders. Everything auth-shaped collapses into
/// `AuthFailed` before it reaches the wire.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(&'static str),
    AuthFailed,
    NotFound(&'static str),
    Conflict(&'static str),
    RateLimited,
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error): (StatusCode, &str) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            // One body for every authentication failure, whatever the cause.
            Self::AuthFailed => (StatusCode::UNAUTHORIZED, "Authentication failed"),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "Too many requests"),
            Self::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "Internal error"),
        };
        (status, Json(json!({ "success": false, "error": error }))).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Failed => ApiError::AuthFailed,
            AuthError::BadRequest(msg) => ApiError::BadRequest(msg),
            AuthError::Store(e) => {
                error!("storage failure in auth path: {}", e);
                ApiError::Internal
            }
        }
    }
}

impl From<DirectoryError> for ApiError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::NotFound => ApiError::NotFound("No bundle available"),
            DirectoryError::Store(e) => {
                error!("storage failure in key directory: {}", e);
                ApiError::Internal
            }
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::BadRequest(msg) => ApiError::BadRequest(msg),
            RelayError::RecipientUnknown => ApiError::NotFound("Recipient unknown"),
            RelayError::Store(e) => {
                error!("storage failure in relay: {}", e);
                ApiError::Internal
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateUsername => ApiError::Conflict("Username already taken"),
            StoreError::Sqlite(e) => {
                error!("storage failure: {}", e);
                ApiError::Internal
            }
        }
    }
}

fn iso(secs: u64) -> String {
    Utc.timestamp_opt(secs as i64, 0)
        .single()
        .unwrap_or_default()
        .to_rfc3339()
}

fn user_json(user: &UserRecord) -> Value {
    json!({
        "id": user.id,
        "username": user.username,
        "identity_public_key": user.identity_public_key,
        "registration_id": user.registration_id,
        "created_at": iso(user.created_at_secs),
        "updated_at": iso(user.updated_at_secs),
    })
}

fn valid_username(username: &str) -> bool {
    !username.is_empty()
        && username.len() <= MAX_USERNAME_LEN
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

// ============================================================================
// Middleware
// ============================================================================

/// Rate-limit key: peer address when the listener provides it, otherwise a
/// forwarded-for hint, otherwise one shared bucket.
fn client_key(request: &Request) -> String {
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "local".to_string())
}

fn enforce_limit(limiter: &RateLimiter, state: &AppState, request: &Request) -> Result<(), ApiError> {
    if limiter.consume(&client_key(request)) {
        Ok(())
    } else {
        state.metrics.rate_limited.inc();
        Err(ApiError::RateLimited)
    }
}

async fn limit_challenge(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    match enforce_limit(&state.limiters.challenge, &state, &request) {
        Ok(()) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

async fn limit_verify(State(state): State<AppState>, request: Request, next: Next) -> Response {
    match enforce_limit(&state.limiters.verify, &state, &request) {
        Ok(()) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

async fn limit_logout(State(state): State<AppState>, request: Request, next: Next) -> Response {
    match enforce_limit(&state.limiters.logout, &state, &request) {
        Ok(()) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

async fn limit_api(State(state): State<AppState>, request: Request, next: Next) -> Response {
    match enforce_limit(&state.limiters.api, &state, &request) {
        Ok(()) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

async fn limit_files(State(state): State<AppState>, request: Request, next: Next) -> Response {
    match enforce_limit(&state.limiters.files, &state, &request) {
        Ok(()) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

/// Bearer middleware: only `Authorization: Bearer <token>` is accepted; any
/// other shape is treated as no credentials at all. Verified claims land in
/// the request extensions.
async fn require_bearer(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let claims = match token.map(|t| state.auth.verify_bearer(t)) {
        Some(Ok(claims)) => claims,
        _ => {
            state.metrics.auth_failures.inc();
            return ApiError::AuthFailed.into_response();
        }
    };

    request.extensions_mut().insert(claims);
    next.run(request).await
}

/// Middleware to check bearer token for the metrics endpoint.
async fn metrics_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_token) = state.metrics_token {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected_token);

        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Bearer")],
                "Unauthorized",
            )
                .into_response();
        }
    }
    next.run(request).await
}

// ============================================================================
// Router
// ============================================================================

/// Creates the API router.
pub fn create_router(state: AppState) -> Router {
    let auth_routes = Router::new()
        .route(
            "/api/auth/challenge",
            post(auth_challenge).layer(middleware::from_fn_with_state(
                state.clone(),
                limit_challenge,
            )),
        )
        .route(
            "/api/auth/verify",
            post(auth_verify).layer(middleware::from_fn_with_state(state.clone(), limit_verify)),
        )
        .route(
            "/api/auth/logout",
            post(auth_logout)
                .layer(middleware::from_fn_with_state(state.clone(), limit_logout))
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    require_bearer,
                )),
        );

    let api_routes = Router::new()
        .route("/api/keys/signed-pre-key", post(upload_signed_pre_key))
        .route("/api/keys/one-time-pre-keys", post(upload_one_time_pre_keys))
        .route("/api/keys/bundle/:user_id", get(fetch_bundle))
        .route(
            "/api/keys/one-time-pre-keys/count/:user_id",
            get(one_time_key_count),
        )
        .route("/api/messages/send", post(send_message))
        .route("/api/messages/offline", get(fetch_offline))
        .route("/api/messages/batch", delete(ack_delete))
        .layer(middleware::from_fn_with_state(state.clone(), limit_api))
        .layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    let file_routes = Router::new()
        .route("/api/files/upload", post(upload_file))
        .route("/api/files/:file_id", get(fetch_file).delete(delete_file))
        .layer(middleware::from_fn_with_state(state.clone(), limit_files))
        .layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    let metrics_route = Router::new()
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn_with_state(state.clone(), metrics_auth));

    Router::new()
        .route("/api/users/register", post(register_user))
        .route("/api/users/by-username/:username", get(user_by_username))
        .route("/api/users/:id", get(user_by_id))
        .route("/api/users/:id/identity", put(rotate_identity))
        .route("/health", get(health_handler))
        .merge(auth_routes)
        .merge(api_routes)
        .merge(file_routes)
        .merge(metrics_route)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .with_state(state)
}

// ============================================================================
// Users
// ============================================================================

#[derive(Deserialize)]
struct RegisterRequest {
    username: String,
    identity_public_key: String,
    registration_id: u32,
}

async fn register_user(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !valid_username(&req.username) {
        return Err(ApiError::BadRequest("Invalid username"));
    }
    if !identity::is_valid_public_key(&req.identity_public_key) {
        return Err(ApiError::BadRequest("Invalid identity key"));
    }

    let user = state
        .store
        .create_user(&req.username, &req.identity_public_key, req.registration_id)?;
    Ok((StatusCode::CREATED, envelope_ok(user_json(&user))))
}

async fn user_by_username(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state
        .store
        .user_by_username(&username)?
        .ok_or(ApiError::NotFound("User not found"))?;
    Ok(envelope_ok(user_json(&user)))
}

async fn user_by_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state
        .store
        .user_by_id(&id)?
        .ok_or(ApiError::NotFound("User not found"))?;
    Ok(envelope_ok(user_json(&user)))
}

#[derive(Deserialize)]
struct RotateIdentityRequest {
    identity_public_key: String,
}

async fn rotate_identity(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RotateIdentityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !identity::is_valid_public_key(&req.identity_public_key) {
        return Err(ApiError::BadRequest("Invalid identity key"));
    }
    if !state
        .store
        .rotate_identity_key(&id, &req.identity_public_key)?
    {
        return Err(ApiError::NotFound("User not found"));
    }
    let user = state
        .store
        .user_by_id(&id)?
        .ok_or(ApiError::NotFound("User not found"))?;
    Ok(envelope_ok(user_json(&user)))
}

// ============================================================================
// Authentication
// ============================================================================

#[derive(Deserialize)]
struct ChallengeRequest {
    username: String,
    device_id: String,
}

async fn auth_challenge(
    State(state): State<AppState>,
    Json(req): Json<ChallengeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let nonce = state
        .auth
        .issue_challenge(&req.username, &req.device_id)
        .map_err(|e| {
            state.metrics.auth_failures.inc();
            ApiError::from(e)
        })?;
    state.metrics.challenges_issued.inc();
    Ok(envelope_ok(json!({ "nonce": nonce })))
}

#[derive(Deserialize)]
struct VerifyRequest {
    username: String,
    signature: String,
    device_id: String,
    #[serde(default)]
    fcm_token: Option<String>,
}

async fn auth_verify(
    State(state): State<AppState>,
    Json(req): Json<VerifyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .auth
        .verify_challenge(
            &req.username,
            &req.signature,
            &req.device_id,
            req.fcm_token.as_deref(),
        )
        .map_err(|e| {
            state.metrics.auth_failures.inc();
            ApiError::from(e)
        })?;

    state.metrics.logins_ok.inc();
    Ok(envelope_ok(json!({
        "token": session.token,
        "user": user_json(&session.user),
        "remaining_one_time_key_count": session.remaining_one_time_key_count,
        "low_key_warn": session.low_key_warn,
    })))
}

async fn auth_logout(
    State(state): State<AppState>,
    claims: axum::Extension<TokenClaims>,
) -> Result<impl IntoResponse, ApiError> {
    state.auth.logout(&claims.user_id, &claims.device_id)?;
    Ok(envelope_ok(json!({ "logged_out": true })))
}

// ============================================================================
// Key directory
// ============================================================================

#[derive(Deserialize)]
struct SignedPreKeyRequest {
    key_id: u32,
    public_key: String,
    signature: String,
}

async fn upload_signed_pre_key(
    State(state): State<AppState>,
    claims: axum::Extension<TokenClaims>,
    Json(req): Json<SignedPreKeyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !identity::is_valid_public_key(&req.public_key) {
        return Err(ApiError::BadRequest("Invalid pre-key"));
    }
    if identity::decode_signature(&req.signature).is_none() {
        return Err(ApiError::BadRequest("Invalid signature encoding"));
    }
    state
        .directory
        .upload_signed_pre_key(&claims.user_id, req.key_id, &req.public_key, &req.signature)?;
    Ok(envelope_ok(json!({ "key_id": req.key_id })))
}

#[derive(Deserialize)]
struct OneTimePreKeysRequest {
    keys: Vec<OneTimePreKeyUpload>,
}

async fn upload_one_time_pre_keys(
    State(state): State<AppState>,
    claims: axum::Extension<TokenClaims>,
    Json(req): Json<OneTimePreKeysRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.keys.is_empty() {
        return Err(ApiError::BadRequest("No keys supplied"));
    }
    if req
        .keys
        .iter()
        .any(|k| !identity::is_valid_public_key(&k.public_key))
    {
        return Err(ApiError::BadRequest("Invalid pre-key"));
    }
    let accepted = state
        .directory
        .upload_one_time_pre_keys(&claims.user_id, &req.keys)?;
    Ok(envelope_ok(json!({ "accepted": accepted })))
}

async fn fetch_bundle(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let bundle = state.directory.bundle(&user_id)?;
    state.metrics.bundles_served.inc();
    if bundle.one_time_pre_key.is_some() {
        state.metrics.one_time_keys_consumed.inc();
    }
    let value = serde_json::to_value(&bundle).map_err(|_| ApiError::Internal)?;
    Ok(envelope_ok(value))
}

async fn one_time_key_count(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let count = state.directory.one_time_key_count(&user_id)?;
    Ok(envelope_ok(json!({ "count": count })))
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Deserialize)]
struct SendRequest {
    recipient_id: String,
    ciphertext: String,
    #[serde(default, rename = "type")]
    message_type: MessageType,
}

async fn send_message(
    State(state): State<AppState>,
    claims: axum::Extension<TokenClaims>,
    Json(req): Json<SendRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.relay.send(
        &claims.user_id,
        &req.recipient_id,
        &req.ciphertext,
        req.message_type,
    )?;

    if outcome.delivered {
        state.metrics.messages_delivered_online.inc();
    } else {
        state.metrics.messages_queued.inc();
    }
    let value = serde_json::to_value(&outcome).map_err(|_| ApiError::Internal)?;
    Ok(envelope_ok(value))
}

#[derive(Deserialize)]
struct OfflineQuery {
    limit: Option<usize>,
}

async fn fetch_offline(
    State(state): State<AppState>,
    claims: axum::Extension<TokenClaims>,
    Query(query): Query<OfflineQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(MAX_FETCH_LIMIT);
    if limit == 0 || limit > MAX_FETCH_LIMIT {
        return Err(ApiError::BadRequest("limit must be between 1 and 100"));
    }

    let messages = state.relay.fetch_offline(&claims.user_id, limit)?;
    state.metrics.messages_drained.inc_by(messages.len() as u64);
    let value = serde_json::to_value(&messages).map_err(|_| ApiError::Internal)?;
    Ok(envelope_ok(json!({ "messages": value })))
}

#[derive(Deserialize)]
struct AckDeleteRequest {
    message_ids: Vec<String>,
}

async fn ack_delete(
    State(state): State<AppState>,
    claims: axum::Extension<TokenClaims>,
    Json(req): Json<AckDeleteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.message_ids.is_empty() {
        return Err(ApiError::BadRequest("No message ids"));
    }
    if req
        .message_ids
        .iter()
        .any(|id| uuid::Uuid::parse_str(id).is_err())
    {
        return Err(ApiError::BadRequest("Malformed message id"));
    }

    let deleted = state.relay.ack_delete(&claims.user_id, &req.message_ids)?;
    state.metrics.messages_acked.inc_by(deleted as u64);
    Ok(envelope_ok(json!({ "deleted": deleted })))
}

// ============================================================================
// Files (external collaborator)
// ============================================================================

#[derive(Deserialize)]
struct FileUploadRequest {
    data: String,
}

async fn upload_file(
    State(state): State<AppState>,
    _claims: axum::Extension<TokenClaims>,
    Json(req): Json<FileUploadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let data = STANDARD
        .decode(&req.data)
        .map_err(|_| ApiError::BadRequest("File data is not base64"))?;
    let file_id = state.files.put(&data).map_err(|e| {
        error!("file store write failed: {}", e);
        ApiError::Internal
    })?;
    Ok(envelope_ok(json!({ "file_id": file_id })))
}

async fn fetch_file(
    State(state): State<AppState>,
    _claims: axum::Extension<TokenClaims>,
    Path(file_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let data = state
        .files
        .get(&file_id)
        .map_err(|e| {
            error!("file store read failed: {}", e);
            ApiError::Internal
        })?
        .ok_or(ApiError::NotFound("File not found"))?;
    Ok(envelope_ok(json!({
        "file_id": file_id,
        "data": STANDARD.encode(&data),
    })))
}

async fn delete_file(
    State(state): State<AppState>,
    _claims: axum::Extension<TokenClaims>,
    Path(file_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.files.delete(&file_id).map_err(|e| {
        error!("file store delete failed: {}", e);
        ApiError::Internal
    })?;
    if !deleted {
        return Err(ApiError::NotFound("File not found"));
    }
    Ok(envelope_ok(json!({ "deleted": true })))
}

// ============================================================================
// Health and metrics
// ============================================================================

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    envelope_ok(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics_text = state.metrics.encode();

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics_text,
    )
}
