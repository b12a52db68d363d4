//! Shared types for the realtime gateway.
//!
//! This module defines the identity, role, topic and event values that flow
//! through the system, plus the JSON frames exchanged with WebSocket clients.
//! Names (roles, topics, event tags) are validated once when they enter the
//! process; everything downstream works with the typed values.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

/// Maximum length of a role name or event tag.
pub const MAX_TAG_LENGTH: usize = 32;

/// Maximum length of the key part of a topic name.
pub const MAX_TOPIC_KEY_LENGTH: usize = 128;

/// Separator between the kind and key of a topic name.
pub const TOPIC_SEPARATOR: char = ':';

/// Legacy prefix accepted (and stripped) on role names.
const LEGACY_ROLE_PREFIX: &str = "ROLE_";

/// Errors raised when a role, topic or event tag fails validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    /// The name was empty after trimming.
    #[error("{kind} cannot be empty")]
    Empty { kind: &'static str },

    /// The name exceeds the allowed length.
    #[error("{kind} '{value}' exceeds {max} characters")]
    TooLong {
        kind: &'static str,
        value: String,
        max: usize,
    },

    /// The name contains characters outside the allowed set.
    #[error("{kind} '{value}' contains invalid characters")]
    InvalidCharacters { kind: &'static str, value: String },

    /// A topic name without the `<kind>:<key>` shape.
    #[error("topic '{0}' must have the form <kind>:<key>")]
    MissingSeparator(String),

    /// A topic whose kind is not one of `game`, `user` or `admin`.
    #[error("unknown topic kind '{0}'")]
    UnknownTopicKind(String),

    /// A `user:` topic whose key is not a user id.
    #[error("topic '{0}' does not name a valid user id")]
    InvalidUserId(String),
}

/// Validates an upper-case tag (`[A-Z0-9_]`, 1..=32 chars).
fn validate_tag(kind: &'static str, value: &str) -> Result<String, NameError> {
    if value.is_empty() {
        return Err(NameError::Empty { kind });
    }
    if value.len() > MAX_TAG_LENGTH {
        return Err(NameError::TooLong {
            kind,
            value: value.to_string(),
            max: MAX_TAG_LENGTH,
        });
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(NameError::InvalidCharacters {
            kind,
            value: value.to_string(),
        });
    }
    Ok(value.to_string())
}

// ============================================================================
// Identity
// ============================================================================

/// Opaque unique user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A named role granted to an identity.
///
/// Roles are parsed case-insensitively and an optional legacy `ROLE_` prefix
/// is stripped, so `"role_admin"`, `"ROLE_ADMIN"` and `"admin"` all parse to
/// [`Role::Admin`]. Unknown names become [`Role::Custom`] after validation.
///
/// # Example
///
/// ```rust
/// use pb_realtime::types::Role;
///
/// assert_eq!(Role::parse("ROLE_admin").unwrap(), Role::Admin);
/// assert_eq!(Role::parse("coach").unwrap(), Role::Custom("COACH".to_string()));
/// assert!(Role::parse("ROLE_").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Admin,
    User,
    Dev,
    Custom(String),
}

impl Role {
    /// Parses and normalises a role name.
    ///
    /// # Errors
    ///
    /// Returns [`NameError`] if the normalised name is empty, too long or
    /// contains characters other than `A-Z`, `0-9` and `_`.
    pub fn parse(raw: &str) -> Result<Self, NameError> {
        let upper = raw.trim().to_ascii_uppercase();
        let name = upper.strip_prefix(LEGACY_ROLE_PREFIX).unwrap_or(&upper);

        match name {
            "ADMIN" => Ok(Self::Admin),
            "USER" => Ok(Self::User),
            "DEV" => Ok(Self::Dev),
            other => validate_tag("role", other).map(Self::Custom),
        }
    }

    /// Returns the canonical (prefix-less, upper-case) name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Admin => "ADMIN",
            Self::User => "USER",
            Self::Dev => "DEV",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Role {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// A set of unique roles, serialised as a JSON array of names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleSet(BTreeSet<Role>);

impl RoleSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses every name, failing on the first invalid one.
    pub fn parse_all<S: AsRef<str>>(names: &[S]) -> Result<Self, NameError> {
        names
            .iter()
            .map(|name| Role::parse(name.as_ref()))
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Self)
    }

    /// Inserts a role, returning `false` if it was already present.
    pub fn insert(&mut self, role: Role) -> bool {
        self.0.insert(role)
    }

    #[must_use]
    pub fn contains(&self, role: &Role) -> bool {
        self.0.contains(role)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Role> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical role names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|role| role.as_str().to_string()).collect()
    }
}

impl FromIterator<Role> for RoleSet {
    fn from_iter<I: IntoIterator<Item = Role>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Public profile of a user account.
///
/// The identifier is immutable; roles can only be changed by an
/// administrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub roles: RoleSet,
}

// ============================================================================
// Topics
// ============================================================================

/// The broadcast scope a topic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    /// A shared game session (`game:<id>`).
    Game,
    /// A user's private live feed (`user:<user-id>`), owned by that user.
    User(UserId),
    /// An operator channel (`admin:<name>`).
    Admin,
}

impl TopicKind {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Game => "game",
            Self::User(_) => "user",
            Self::Admin => "admin",
        }
    }
}

/// A logical broadcast channel, named deterministically from a domain key.
///
/// # Example
///
/// ```rust
/// use pb_realtime::types::{Topic, TopicKind};
///
/// let topic = Topic::game("123").unwrap();
/// assert_eq!(topic.as_str(), "game:123");
/// assert_eq!(Topic::parse("game:123").unwrap(), topic);
/// assert_eq!(topic.kind(), TopicKind::Game);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    kind: TopicKind,
    name: String,
}

impl Topic {
    /// Topic for a shared game session.
    pub fn game(game_id: &str) -> Result<Self, NameError> {
        let key = validate_topic_key(game_id)?;
        Ok(Self::build(TopicKind::Game, key))
    }

    /// Topic for a user's private feed.
    #[must_use]
    pub fn user(owner: UserId) -> Self {
        Self::build(TopicKind::User(owner), &owner.to_string())
    }

    /// Topic for an operator channel.
    pub fn admin(name: &str) -> Result<Self, NameError> {
        let key = validate_topic_key(name)?;
        Ok(Self::build(TopicKind::Admin, key))
    }

    /// Parses a `<kind>:<key>` topic name.
    pub fn parse(raw: &str) -> Result<Self, NameError> {
        let raw = raw.trim();
        let (kind, key) = raw
            .split_once(TOPIC_SEPARATOR)
            .ok_or_else(|| NameError::MissingSeparator(raw.to_string()))?;

        match kind {
            "game" => Self::game(key),
            "admin" => Self::admin(key),
            "user" => {
                validate_topic_key(key)?;
                let owner = key
                    .parse::<UserId>()
                    .map_err(|_| NameError::InvalidUserId(raw.to_string()))?;
                Ok(Self::user(owner))
            }
            other => Err(NameError::UnknownTopicKind(other.to_string())),
        }
    }

    fn build(kind: TopicKind, key: &str) -> Self {
        Self {
            kind,
            name: format!("{}{}{}", kind.prefix(), TOPIC_SEPARATOR, key),
        }
    }

    #[must_use]
    pub fn kind(&self) -> TopicKind {
        self.kind
    }

    /// The key part of the name (after the separator).
    #[must_use]
    pub fn key(&self) -> &str {
        &self.name[self.kind.prefix().len() + 1..]
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.name
    }
}

fn validate_topic_key(key: &str) -> Result<&str, NameError> {
    if key.is_empty() {
        return Err(NameError::Empty { kind: "topic key" });
    }
    if key.len() > MAX_TOPIC_KEY_LENGTH {
        return Err(NameError::TooLong {
            kind: "topic key",
            value: key.to_string(),
            max: MAX_TOPIC_KEY_LENGTH,
        });
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(NameError::InvalidCharacters {
            kind: "topic key",
            value: key.to_string(),
        });
    }
    Ok(key)
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl FromStr for Topic {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name)
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Events
// ============================================================================

/// Discriminating tag of an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    /// An in-session tag marker.
    Tag,
    /// Any other upper-case tag.
    Custom(String),
}

impl EventType {
    /// Parses an event tag. Tags are upper-case `[A-Z0-9_]`, which also keeps
    /// the bridge envelope separator out of them.
    pub fn parse(raw: &str) -> Result<Self, NameError> {
        match raw {
            "TAG" => Ok(Self::Tag),
            other => validate_tag("event type", other).map(Self::Custom),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Tag => "TAG",
            Self::Custom(tag) => tag,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// A transient, immutable event. Events are never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,

    pub origin_user_id: UserId,

    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(event_type: EventType, origin_user_id: UserId, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            timestamp: now_millis(),
            origin_user_id,
            payload,
        }
    }
}

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// ============================================================================
// WebSocket frames
// ============================================================================

/// Body of a client `publish` frame. Fields stay raw so each one can be
/// rejected with its own error code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub topic: String,

    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default)]
    pub timestamp: Option<i64>,

    #[serde(default)]
    pub origin_user_id: Option<String>,

    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Frames sent by clients, tagged by `op`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish(PublishRequest),
    Ping,
}

/// Frames pushed to clients, tagged by `op`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Ready {
        connection_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
    },
    Subscribed {
        topic: String,
    },
    Unsubscribed {
        topic: String,
    },
    Event {
        topic: String,
        #[serde(flatten)]
        event: Event,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
    },
    Pong,
}

impl ServerFrame {
    /// Outbound frame for an event on a topic.
    #[must_use]
    pub fn event(topic: &Topic, event: Event) -> Self {
        Self::Event {
            topic: topic.to_string(),
            event,
        }
    }

    /// Error notification for the connection that caused it.
    #[must_use]
    pub fn error(code: &str, message: impl Into<String>, topic: Option<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
            topic,
        }
    }
}
