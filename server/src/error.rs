//! Error types for the realtime server.
//!
//! Each component has its own error enum with a stable machine-readable
//! `code()`; [`ServerError`] gathers them for the HTTP layer and maps each
//! category onto a status code.
//!
//! # Error Types
//!
//! - [`ConfigError`] - configuration loading and validation
//! - [`AuthError`] - token and credential failures (401)
//! - [`AuthzError`] - permission failures (403)
//! - [`IdentityError`] - account and role management (400 / 404 / 409)
//! - [`BridgeError`] - shared channel unavailable (503)
//! - [`ServerError`] - top-level error returned by HTTP handlers
//!
//! # Example
//!
//! ```rust
//! use axum::http::StatusCode;
//! use pb_realtime::auth::AuthError;
//! use pb_realtime::error::ServerError;
//!
//! let err = ServerError::from(AuthError::ExpiredToken);
//! assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
//! assert_eq!(err.code(), "expired_token");
//! ```

use std::error::Error;
use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

pub use crate::auth::AuthError;
pub use crate::bridge::BridgeError;
pub use crate::config::ConfigError;
pub use crate::guard::AuthzError;
pub use crate::identity::IdentityError;

/// Top-level error type for the realtime server.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error during initialization.
    Config(ConfigError),

    /// Authentication failure.
    Auth(AuthError),

    /// Authorization failure.
    Authz(AuthzError),

    /// Account management failure.
    Identity(IdentityError),

    /// The shared channel is unavailable.
    Bridge(BridgeError),

    /// Request validation failure.
    Validation(String),

    /// Unexpected failure.
    Internal(String),
}

impl ServerError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Auth(err) if err.is_client_error() => StatusCode::UNAUTHORIZED,
            Self::Auth(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Authz(AuthzError::Unauthenticated { .. }) => StatusCode::UNAUTHORIZED,
            Self::Authz(_) => StatusCode::FORBIDDEN,
            Self::Identity(err) => match err {
                IdentityError::UsernameTaken(_)
                | IdentityError::EmailTaken(_)
                | IdentityError::RoleExists(_) => StatusCode::CONFLICT,
                IdentityError::NotFound(_) | IdentityError::RoleNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                IdentityError::Invalid(_) => StatusCode::BAD_REQUEST,
                IdentityError::Hashing(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Bridge(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(err) => err.code(),
            Self::Auth(err) => err.code(),
            Self::Authz(err) => err.code(),
            Self::Identity(err) => err.code(),
            Self::Bridge(err) => err.code(),
            Self::Validation(_) => "invalid_request",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::Auth(err) => write!(f, "authentication failed: {err}"),
            Self::Authz(err) => write!(f, "permission denied: {err}"),
            Self::Identity(err) => write!(f, "{err}"),
            Self::Bridge(err) => write!(f, "{err}"),
            Self::Validation(msg) => write!(f, "validation error: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Auth(err) => Some(err),
            Self::Authz(err) => Some(err),
            Self::Identity(err) => Some(err),
            Self::Bridge(err) => Some(err),
            Self::Validation(_) | Self::Internal(_) => None,
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<AuthError> for ServerError {
    fn from(err: AuthError) -> Self {
        Self::Auth(err)
    }
}

impl From<AuthzError> for ServerError {
    fn from(err: AuthzError) -> Self {
        Self::Authz(err)
    }
}

impl From<IdentityError> for ServerError {
    fn from(err: IdentityError) -> Self {
        Self::Identity(err)
    }
}

impl From<BridgeError> for ServerError {
    fn from(err: BridgeError) -> Self {
        Self::Bridge(err)
    }
}

/// JSON error response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() && !matches!(self, Self::Bridge(_)) {
            error!(error = %self, "Request failed with internal error");
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        (status, Json(ErrorResponse::new(message).with_code(self.code()))).into_response()
    }
}
