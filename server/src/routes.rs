//! HTTP route handlers for the realtime server.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `POST /api/v1/auth/login` - Exchange credentials for an access token
//! - `POST /api/v1/auth/register` - Create a `USER` account
//! - `GET /api/v1/users` - List accounts (`ADMIN` only)
//! - `GET|DELETE /api/v1/users/{id}` - Look up or remove an account (`ADMIN` only)
//! - `PUT /api/v1/users/{id}/roles` - Replace a user's roles (`ADMIN` only)
//! - `GET|POST /api/v1/roles`, `DELETE /api/v1/roles/{name}` - Role catalogue (`ADMIN` only)
//! - `GET /ws` - Realtime WebSocket endpoint
//! - `GET /health` - Health check endpoint
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains:
//! - Configuration
//! - Token service, authenticator and role catalogue
//! - The realtime hub (connection registry + cross-instance bridge)
//! - Server start time for uptime reporting
//!
//! # Example
//!
//! ```rust,no_run
//! use pb_realtime::config::Config;
//! use pb_realtime::routes::{create_router, AppState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let state = AppState::new(config).expect("failed to build state");
//!     let _tasks = state.start_background_tasks();
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{FromRequestParts, Path, Query, State, WebSocketUpgrade},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, debug_span, info, Span};

use crate::auth::{bearer_token, AuthError, Claims, TokenService};
use crate::bridge::{Bridge, BridgeConfig, LinkState};
use crate::config::Config;
use crate::error::ServerError;
use crate::gateway::{run_connection, RealtimeHub};
use crate::guard::{authorize, AccessRule, Action};
use crate::identity::{
    Authenticator, IdentityError, IdentityStore, MemoryIdentityStore, Passwords, RoleCatalog,
};
use crate::registry::ConnectionRegistry;
use crate::transport::{MemoryTransport, RedisTransport, Transport, TransportError};
use crate::types::{Identity, Role, RoleSet, UserId};

/// Shortest interval between idle-connection sweeps.
const MIN_REAPER_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Issues and validates access tokens.
    pub tokens: Arc<TokenService>,

    /// Login, registration and account store.
    pub authenticator: Authenticator,

    /// Role names administrators can assign.
    pub roles: Arc<RoleCatalog>,

    /// Local connections and the cross-instance bridge.
    pub hub: RealtimeHub,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates application state from configuration.
    ///
    /// Uses Redis for the shared channel when `redis_url` is set, otherwise
    /// an in-process hub.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Config`] if the Redis URL is invalid.
    pub fn new(config: Config) -> Result<Self, TransportError> {
        let transport: Arc<dyn Transport> = match &config.redis_url {
            Some(url) => Arc::new(RedisTransport::open(url)?),
            None => Arc::new(MemoryTransport::new()),
        };

        Ok(Self::with_components(
            config,
            Arc::new(MemoryIdentityStore::new()),
            Passwords::default(),
            transport,
        ))
    }

    /// Creates application state with an explicit account store, password
    /// hashing and shared channel.
    ///
    /// Instances built over clones of the same [`MemoryTransport`] exchange
    /// events with each other.
    pub fn with_components(
        config: Config,
        store: Arc<dyn IdentityStore>,
        passwords: Passwords,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let tokens = Arc::new(TokenService::new(config.jwt_secret.as_bytes(), config.token_ttl));
        let authenticator = Authenticator::new(store, Arc::clone(&tokens), passwords);
        let bridge = Bridge::new(transport, BridgeConfig::from(&config));
        let hub = RealtimeHub::new(ConnectionRegistry::new(), bridge);

        Self {
            config: Arc::new(config),
            tokens,
            authenticator,
            roles: Arc::new(RoleCatalog::new()),
            hub,
            start_time: Instant::now(),
        }
    }

    /// Starts the bridge link and the idle-connection reaper.
    pub fn start_background_tasks(&self) -> BackgroundTasks {
        let idle_timeout = self.config.idle_timeout;
        let interval = (idle_timeout / 2).max(MIN_REAPER_INTERVAL);

        BackgroundTasks {
            bridge_link: self.hub.bridge().start(),
            reaper: self.hub.spawn_reaper_task(interval, idle_timeout),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"<Config>")
            .field("tokens", &self.tokens)
            .field("roles", &self.roles)
            .field("hub", &self.hub)
            .field("start_time", &self.start_time)
            .finish()
    }
}

/// Handles of the long-running tasks started for an [`AppState`].
#[derive(Debug)]
pub struct BackgroundTasks {
    pub bridge_link: JoinHandle<()>,
    pub reaper: JoinHandle<()>,
}

impl BackgroundTasks {
    /// Aborts every task.
    pub fn shutdown(self) {
        self.bridge_link.abort();
        self.reaper.abort();
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/auth/login", post(post_login))
        .route("/api/v1/auth/register", post(post_register))
        .route("/api/v1/users", get(get_users))
        .route("/api/v1/users/{id}", get(get_user).delete(delete_user))
        .route("/api/v1/users/{id}/roles", put(put_user_roles))
        .route("/api/v1/roles", get(get_roles).post(post_role))
        .route("/api/v1/roles/{name}", delete(delete_role))
        .route("/ws", get(get_ws))
        .route("/health", get(get_health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .with_state(state)
}

/// Span for one HTTP request.
///
/// Records the path only: the query string of `/ws` may carry an access
/// token.
fn request_span(request: &Request<Body>) -> Span {
    debug_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
        version = ?request.version(),
    )
}

// ============================================================================
// Bearer authentication
// ============================================================================

/// Extractor for requests carrying a valid `Authorization: Bearer` token.
#[derive(Debug, Clone)]
pub struct Authenticated(pub Claims);

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = header_token(&parts.headers).ok_or(AuthError::MissingToken)?;
        let claims = state.tokens.validate(token)?;
        Ok(Self(claims))
    }
}

fn header_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
}

// ============================================================================
// Auth endpoints
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub roles: RoleSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRolesRequest {
    pub roles: Vec<String>,
}

/// POST /api/v1/auth/login
///
/// # Responses
///
/// - `200 OK` - token plus the caller's profile
/// - `401 Unauthorized` - `invalid_credentials`
async fn post_login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ServerError> {
    let authenticator = state.authenticator.clone();
    // Argon2 verification is CPU-bound.
    let outcome = tokio::task::spawn_blocking(move || {
        authenticator.login(&request.username, &request.password)
    })
    .await
    .map_err(|e| ServerError::internal(e.to_string()))??;

    let identity = outcome.identity;
    Ok(Json(LoginResponse {
        token: outcome.token.token,
        token_type: "Bearer".to_string(),
        expires_at: outcome.token.expires_at,
        id: identity.id,
        username: identity.username,
        email: identity.email,
        roles: identity.roles,
    }))
}

/// POST /api/v1/auth/register
///
/// # Responses
///
/// - `201 Created` - the new account's profile
/// - `400 Bad Request` - invalid username, email or password
/// - `409 Conflict` - `username_taken` / `email_taken`
async fn post_register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<Identity>), ServerError> {
    let authenticator = state.authenticator.clone();
    let identity = tokio::task::spawn_blocking(move || {
        authenticator.register(&request.username, &request.email, &request.password)
    })
    .await
    .map_err(|e| ServerError::internal(e.to_string()))??;

    Ok((StatusCode::CREATED, Json(identity)))
}

/// PUT /api/v1/users/{id}/roles
///
/// Replaces the target user's roles. Role names are normalised (case and the
/// legacy `ROLE_` prefix); an invalid name rejects the whole request.
///
/// # Responses
///
/// - `200 OK` - updated profile
/// - `401 Unauthorized` - missing or invalid token
/// - `403 Forbidden` - caller lacks `ADMIN`
/// - `404 Not Found` - unknown user
async fn put_user_roles(
    State(state): State<AppState>,
    Authenticated(claims): Authenticated,
    Path(id): Path<String>,
    Json(request): Json<UpdateRolesRequest>,
) -> Result<Json<Identity>, ServerError> {
    require_admin(&claims, Action::ManageRoles)?;

    let user_id = parse_user_id(&id)?;
    let roles =
        RoleSet::parse_all(&request.roles).map_err(|e| ServerError::validation(e.to_string()))?;

    let identity = state.authenticator.store().set_roles(user_id, roles)?;
    info!(
        actor = %claims.user_id,
        user_id = %identity.id,
        roles = ?identity.roles.names(),
        "Updated user roles"
    );
    Ok(Json(identity))
}

// ============================================================================
// Administration
// ============================================================================

fn require_admin(claims: &Claims, action: Action) -> Result<(), ServerError> {
    authorize(Some(claims), action, &AccessRule::role(Role::Admin))?;
    Ok(())
}

fn parse_user_id(raw: &str) -> Result<UserId, ServerError> {
    raw.parse::<UserId>()
        .map_err(|_| ServerError::validation(format!("'{raw}' is not a valid user id")))
}

/// A role in the catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleEntry {
    pub name: String,
}

impl From<&Role> for RoleEntry {
    fn from(role: &Role) -> Self {
        Self {
            name: role.as_str().to_string(),
        }
    }
}

/// GET /api/v1/users - every account, ordered by username.
async fn get_users(
    State(state): State<AppState>,
    Authenticated(claims): Authenticated,
) -> Result<Json<Vec<Identity>>, ServerError> {
    require_admin(&claims, Action::ManageUsers)?;
    Ok(Json(state.authenticator.store().list()))
}

/// GET /api/v1/users/{id}
async fn get_user(
    State(state): State<AppState>,
    Authenticated(claims): Authenticated,
    Path(id): Path<String>,
) -> Result<Json<Identity>, ServerError> {
    require_admin(&claims, Action::ManageUsers)?;

    let user_id = parse_user_id(&id)?;
    let account = state
        .authenticator
        .store()
        .find_by_id(user_id)
        .ok_or(IdentityError::NotFound(user_id))?;
    Ok(Json(account.identity))
}

/// DELETE /api/v1/users/{id}
///
/// Tokens already issued to the account stay valid until they expire.
///
/// # Responses
///
/// - `204 No Content` - removed
/// - `404 Not Found` - unknown user
async fn delete_user(
    State(state): State<AppState>,
    Authenticated(claims): Authenticated,
    Path(id): Path<String>,
) -> Result<StatusCode, ServerError> {
    require_admin(&claims, Action::ManageUsers)?;

    let user_id = parse_user_id(&id)?;
    let removed = state.authenticator.store().delete(user_id)?;
    info!(actor = %claims.user_id, user_id = %removed.id, "Deleted user");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/roles
async fn get_roles(
    State(state): State<AppState>,
    Authenticated(claims): Authenticated,
) -> Result<Json<Vec<RoleEntry>>, ServerError> {
    require_admin(&claims, Action::ManageRoles)?;
    Ok(Json(state.roles.list().iter().map(RoleEntry::from).collect()))
}

/// POST /api/v1/roles
///
/// The name is normalised like any role (`coach` and `ROLE_COACH` both
/// become `COACH`).
///
/// # Responses
///
/// - `201 Created` - the normalised role
/// - `400 Bad Request` - invalid name
/// - `409 Conflict` - `role_exists`
async fn post_role(
    State(state): State<AppState>,
    Authenticated(claims): Authenticated,
    Json(request): Json<RoleEntry>,
) -> Result<(StatusCode, Json<RoleEntry>), ServerError> {
    require_admin(&claims, Action::ManageRoles)?;

    let role = state.roles.create(&request.name)?;
    info!(actor = %claims.user_id, role = %role, "Created role");
    Ok((StatusCode::CREATED, Json(RoleEntry::from(&role))))
}

/// DELETE /api/v1/roles/{name}
async fn delete_role(
    State(state): State<AppState>,
    Authenticated(claims): Authenticated,
    Path(name): Path<String>,
) -> Result<StatusCode, ServerError> {
    require_admin(&claims, Action::ManageRoles)?;

    let role = state.roles.delete(&name)?;
    info!(actor = %claims.user_id, role = %role, "Deleted role");
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// GET /ws - Realtime connection
// ============================================================================

/// Query parameters for the WebSocket endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WsQueryParams {
    /// Access token, for clients that cannot set headers.
    pub token: Option<String>,
}

/// GET /ws - Realtime endpoint.
///
/// The token is taken from the `Authorization: Bearer` header, falling back
/// to the `token` query parameter. The upgrade always completes; a failed
/// authentication is reported on the socket with close code 4401 and the
/// error code as the reason.
async fn get_ws(
    State(state): State<AppState>,
    Query(params): Query<WsQueryParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = header_token(&headers)
        .or(params.token.as_deref())
        .filter(|token| !token.is_empty());

    let auth = match token {
        Some(token) => state.tokens.validate(token).map(Some),
        None if state.config.allow_anonymous => Ok(None),
        None => Err(AuthError::MissingToken),
    };

    match &auth {
        Ok(Some(claims)) => debug!(user_id = %claims.user_id, "Realtime client connecting"),
        Ok(None) => debug!("Anonymous realtime client connecting"),
        Err(err) => debug!(code = err.code(), "Realtime client failed authentication"),
    }

    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| run_connection(hub, socket, auth))
}

// ============================================================================
// GET /health
// ============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `ok` while the bridge link is up, `degraded` otherwise.
    pub status: String,
    pub connections: usize,
    pub topics: usize,
    pub bridge: LinkState,
    pub uptime_seconds: u64,
}

/// GET /health - Returns server health status and statistics.
/// No authentication required.
async fn get_health(State(state): State<AppState>) -> impl IntoResponse {
    let bridge = state.hub.bridge().link_state();
    let status = if bridge == LinkState::Connected {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        connections: state.hub.registry().connection_count(),
        topics: state.hub.registry().topic_count(),
        bridge,
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================
