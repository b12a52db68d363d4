//! Server configuration module.
//!
//! Parses configuration from environment variables for the realtime server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PB_JWT_SECRET` | Yes | - | HMAC secret for access tokens (>= 32 bytes) |
//! | `PB_TOKEN_TTL_SECS` | No | 86400 | Access token lifetime |
//! | `PORT` | No | 8080 | HTTP server port |
//! | `PB_REDIS_URL` | No | - | Shared pub/sub channel; in-process hub when unset |
//! | `PB_BRIDGE_PREFIX` | No | `rt:` | Prefix of every shared channel name |
//! | `PB_PUBLISH_TIMEOUT_MS` | No | 2000 | Upper bound on a single bridge publish |
//! | `PB_RECONNECT_INITIAL_MS` | No | 100 | First bridge reconnect delay |
//! | `PB_RECONNECT_MAX_MS` | No | 10000 | Reconnect delay cap |
//! | `PB_ALLOW_ANONYMOUS` | No | false | Accept tokenless realtime connections (read-only) |
//! | `PB_IDLE_TIMEOUT_SECS` | No | 60 | Connections silent for longer are reaped |
//! | `PB_ADMIN_PASSWORD` | No | - | Seeds an `admin` account at startup |

use std::env;
use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

/// Minimum accepted length of the token signing secret.
pub const MIN_SECRET_LENGTH: usize = 32;

const DEFAULT_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_BRIDGE_PREFIX: &str = "rt:";
const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_RECONNECT_INITIAL_MS: u64 = 100;
const DEFAULT_RECONNECT_MAX_MS: u64 = 10_000;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingEnvVar(_) => "config_missing",
            Self::InvalidFormat { .. } | Self::InvalidPort(_) => "config_invalid",
            Self::ValidationError(_) => "config_validation",
        }
    }
}

/// Server configuration parsed from environment variables.
#[derive(Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,

    /// Shared HMAC secret used to sign and verify access tokens.
    pub jwt_secret: String,

    /// Lifetime of issued access tokens.
    pub token_ttl: Duration,

    /// Redis URL for the shared channel. `None` selects the in-process hub.
    pub redis_url: Option<String>,

    /// Prefix applied to every shared channel name.
    pub bridge_prefix: String,

    /// Upper bound on a single bridge publish.
    pub publish_timeout: Duration,

    /// First delay before re-establishing a lost bridge link.
    pub reconnect_initial: Duration,

    /// Cap on the bridge reconnect delay.
    pub reconnect_max: Duration,

    /// When true, realtime connections without a token are accepted and
    /// may only subscribe to public topics.
    pub allow_anonymous: bool,

    /// Connections with no inbound traffic for this long are reaped.
    pub idle_timeout: Duration,

    /// Password for the seeded `admin` account.
    pub admin_password: Option<String>,
}

impl Config {
    /// Builds a configuration with default values for everything but the
    /// signing secret.
    ///
    /// # Example
    ///
    /// ```rust
    /// use pb_realtime::config::Config;
    ///
    /// let config = Config::with_secret("0123456789abcdef0123456789abcdef");
    /// assert_eq!(config.port, 8080);
    /// assert!(config.redis_url.is_none());
    /// ```
    pub fn with_secret(jwt_secret: impl Into<String>) -> Self {
        Self {
            port: DEFAULT_PORT,
            jwt_secret: jwt_secret.into(),
            token_ttl: Duration::from_secs(DEFAULT_TOKEN_TTL_SECS),
            redis_url: None,
            bridge_prefix: DEFAULT_BRIDGE_PREFIX.to_string(),
            publish_timeout: Duration::from_millis(DEFAULT_PUBLISH_TIMEOUT_MS),
            reconnect_initial: Duration::from_millis(DEFAULT_RECONNECT_INITIAL_MS),
            reconnect_max: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
            allow_anonymous: false,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            admin_password: None,
        }
    }

    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `PB_JWT_SECRET` is missing or shorter than 32 bytes
    /// - A numeric variable does not parse
    /// - The bridge prefix contains pattern characters
    ///
    /// # Example
    ///
    /// ```no_run
    /// use pb_realtime::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let jwt_secret = env::var("PB_JWT_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("PB_JWT_SECRET".to_string()))?;

        let config = Self {
            port: parse_port()?,
            jwt_secret,
            token_ttl: Duration::from_secs(parse_u64_env(
                "PB_TOKEN_TTL_SECS",
                DEFAULT_TOKEN_TTL_SECS,
            )?),
            redis_url: env::var("PB_REDIS_URL").ok().filter(|s| !s.is_empty()),
            bridge_prefix: env::var("PB_BRIDGE_PREFIX")
                .unwrap_or_else(|_| DEFAULT_BRIDGE_PREFIX.to_string()),
            publish_timeout: Duration::from_millis(parse_u64_env(
                "PB_PUBLISH_TIMEOUT_MS",
                DEFAULT_PUBLISH_TIMEOUT_MS,
            )?),
            reconnect_initial: Duration::from_millis(parse_u64_env(
                "PB_RECONNECT_INITIAL_MS",
                DEFAULT_RECONNECT_INITIAL_MS,
            )?),
            reconnect_max: Duration::from_millis(parse_u64_env(
                "PB_RECONNECT_MAX_MS",
                DEFAULT_RECONNECT_MAX_MS,
            )?),
            allow_anonymous: parse_bool_env("PB_ALLOW_ANONYMOUS"),
            idle_timeout: Duration::from_secs(parse_u64_env(
                "PB_IDLE_TIMEOUT_SECS",
                DEFAULT_IDLE_TIMEOUT_SECS,
            )?),
            admin_password: env::var("PB_ADMIN_PASSWORD").ok().filter(|s| !s.is_empty()),
        };

        config.validate()?;

        if config.allow_anonymous {
            warn!("PB_ALLOW_ANONYMOUS is enabled - tokenless clients may subscribe to game topics");
        }

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_secret.len() < MIN_SECRET_LENGTH {
            return Err(ConfigError::ValidationError(format!(
                "PB_JWT_SECRET must be at least {MIN_SECRET_LENGTH} bytes"
            )));
        }

        if self.token_ttl.is_zero() {
            return Err(ConfigError::ValidationError(
                "PB_TOKEN_TTL_SECS must be greater than zero".to_string(),
            ));
        }

        if self.publish_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "PB_PUBLISH_TIMEOUT_MS must be greater than zero".to_string(),
            ));
        }

        if self.idle_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "PB_IDLE_TIMEOUT_SECS must be greater than zero".to_string(),
            ));
        }

        if self.reconnect_initial.is_zero() || self.reconnect_max < self.reconnect_initial {
            return Err(ConfigError::ValidationError(
                "reconnect delays must be non-zero and PB_RECONNECT_MAX_MS >= PB_RECONNECT_INITIAL_MS"
                    .to_string(),
            ));
        }

        if self
            .bridge_prefix
            .chars()
            .any(|c| matches!(c, '*' | '?' | '[' | ']') || c.is_whitespace())
        {
            return Err(ConfigError::InvalidFormat {
                var: "PB_BRIDGE_PREFIX".to_string(),
                message: "must not contain whitespace or pattern characters".to_string(),
            });
        }

        Ok(())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("jwt_secret", &"<redacted>")
            .field("token_ttl", &self.token_ttl)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "<set>"))
            .field("bridge_prefix", &self.bridge_prefix)
            .field("publish_timeout", &self.publish_timeout)
            .field("reconnect_initial", &self.reconnect_initial)
            .field("reconnect_max", &self.reconnect_max)
            .field("allow_anonymous", &self.allow_anonymous)
            .field("idle_timeout", &self.idle_timeout)
            .field("admin_password", &self.admin_password.as_ref().map(|_| "<set>"))
            .finish()
    }
}

/// Parse a boolean environment variable.
///
/// Returns `true` if the variable is set to "true" (case-insensitive),
/// `false` otherwise.
fn parse_bool_env(name: &str) -> bool {
    env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Parse an unsigned integer environment variable, falling back to `default`.
fn parse_u64_env(name: &str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|e| ConfigError::InvalidFormat {
            var: name.to_string(),
            message: format!("expected a non-negative integer: {e}"),
        }),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: name.to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}
