//! Access token issuance and validation.
//!
//! Tokens are HS256-signed JWTs carrying the user id, username and granted
//! roles. Every instance of the server shares the same secret, so a token
//! issued by one instance is accepted by all of them.
//!
//! # Overview
//!
//! 1. A successful login produces an [`IssuedToken`] via [`TokenService::issue`]
//! 2. Clients present the token on HTTP requests (`Authorization: Bearer`) or
//!    when opening the realtime connection
//! 3. [`TokenService::validate`] turns it back into [`Claims`], or fails with
//!    an [`AuthError`] whose [`code`](AuthError::code) is reported to clients
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use pb_realtime::auth::TokenService;
//! use pb_realtime::types::{Identity, Role, RoleSet, UserId};
//!
//! let service = TokenService::new(b"0123456789abcdef0123456789abcdef", Duration::from_secs(60));
//! let identity = Identity {
//!     id: UserId::new(),
//!     username: "alice".to_string(),
//!     email: "alice@example.com".to_string(),
//!     roles: [Role::User].into_iter().collect(),
//! };
//!
//! let issued = service.issue(&identity, &identity.roles).unwrap();
//! let claims = service.validate(&issued.token).unwrap();
//! assert_eq!(claims.user_id, identity.id);
//! assert!(claims.has_role(&Role::User));
//! ```

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Identity, Role, RoleSet, UserId};

/// Errors that can occur while authenticating a caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The token's expiry is in the past.
    #[error("token has expired")]
    ExpiredToken,

    /// The token could not be decoded or its claims are invalid.
    #[error("token is malformed")]
    MalformedToken,

    /// The token was not signed with the shared secret, or was altered.
    #[error("token signature is invalid")]
    BadSignature,

    /// Unknown username or wrong password. The two cases are deliberately
    /// indistinguishable.
    #[error("invalid username or password")]
    InvalidCredentials,

    /// No token was supplied where one is required.
    #[error("missing access token")]
    MissingToken,

    /// Token signing failed.
    #[error("failed to issue token: {0}")]
    Signing(String),
}

impl AuthError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ExpiredToken => "expired_token",
            Self::MalformedToken => "malformed_token",
            Self::BadSignature => "bad_signature",
            Self::InvalidCredentials => "invalid_credentials",
            Self::MissingToken => "missing_token",
            Self::Signing(_) => "token_signing_failed",
        }
    }

    /// Returns `true` for failures caused by the caller rather than the server.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Signing(_))
    }
}

/// Claim set as it appears inside the token.
#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    sub: String,
    username: String,
    roles: Vec<String>,
    iat: i64,
    exp: i64,
}

/// Validated claims of an access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub user_id: UserId,
    pub username: String,
    pub roles: RoleSet,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Claims {
    pub fn has_role(&self, role: &Role) -> bool {
        self.roles.contains(role)
    }
}

/// A freshly signed token and its expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Signs and validates access tokens with a shared HMAC secret.
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenService {
    /// Creates a service for the given secret and token lifetime.
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "iat", "sub"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issues a token for `identity` carrying `roles`, valid from now.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Signing`] if the token cannot be encoded.
    pub fn issue(&self, identity: &Identity, roles: &RoleSet) -> Result<IssuedToken, AuthError> {
        self.issue_at(identity, roles, Utc::now())
    }

    /// Issues a token as if it had been signed at `issued_at`.
    pub fn issue_at(
        &self,
        identity: &Identity,
        roles: &RoleSet,
        issued_at: DateTime<Utc>,
    ) -> Result<IssuedToken, AuthError> {
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| AuthError::Signing(e.to_string()))?;
        let expires_at = issued_at + ttl;

        let claims = TokenClaims {
            sub: identity.id.to_string(),
            username: identity.username.clone(),
            roles: roles.names(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Signing(e.to_string()))?;

        Ok(IssuedToken { token, expires_at })
    }

    /// Validates a token's signature and expiry and returns its claims.
    ///
    /// # Errors
    ///
    /// - [`AuthError::BadSignature`] if the signature does not verify
    /// - [`AuthError::ExpiredToken`] if the expiry is in the past
    /// - [`AuthError::MalformedToken`] for anything else
    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<TokenClaims>(token, &self.decoding_key, &self.validation)
            .map_err(map_jwt_error)?;
        let claims = data.claims;

        let user_id = claims
            .sub
            .parse::<UserId>()
            .map_err(|_| AuthError::MalformedToken)?;
        let roles = RoleSet::parse_all(&claims.roles).map_err(|_| AuthError::MalformedToken)?;
        let issued_at =
            DateTime::from_timestamp(claims.iat, 0).ok_or(AuthError::MalformedToken)?;
        let expires_at =
            DateTime::from_timestamp(claims.exp, 0).ok_or(AuthError::MalformedToken)?;

        Ok(Claims {
            user_id,
            username: claims.username,
            roles,
            issued_at,
            expires_at,
        })
    }
}

impl fmt::Debug for TokenService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenService")
            .field("algorithm", &"HS256")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
        ErrorKind::InvalidSignature => AuthError::BadSignature,
        _ => AuthError::MalformedToken,
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let (scheme, token) = header_value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
