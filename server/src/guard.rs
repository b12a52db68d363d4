//! Authorization decisions.
//!
//! [`authorize`] checks an optional required role first, then an ownership
//! rule. Topic-level rules come from [`Topic::access_rule`].

use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::auth::Claims;
use crate::types::{Role, Topic, TopicKind, UserId};

/// What the caller is trying to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Subscribe,
    Publish,
    ManageRoles,
    ManageUsers,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Subscribe => "subscribe",
            Self::Publish => "publish",
            Self::ManageRoles => "manage_roles",
            Self::ManageUsers => "manage_users",
        })
    }
}

/// Ownership requirement of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    /// Anyone passing the role check may act.
    Unrestricted,
    /// Only the given user may act.
    Owner(UserId),
    /// Any authenticated caller may act; the actor is recorded.
    Relaxed,
}

/// A role requirement plus an ownership requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRule {
    pub required_role: Option<Role>,
    pub ownership: Ownership,
}

impl AccessRule {
    /// No requirements at all.
    pub fn open() -> Self {
        Self {
            required_role: None,
            ownership: Ownership::Unrestricted,
        }
    }

    pub fn role(role: Role) -> Self {
        Self {
            required_role: Some(role),
            ownership: Ownership::Unrestricted,
        }
    }

    pub fn owner(owner: UserId) -> Self {
        Self {
            required_role: None,
            ownership: Ownership::Owner(owner),
        }
    }

    pub fn relaxed() -> Self {
        Self {
            required_role: None,
            ownership: Ownership::Relaxed,
        }
    }

    #[must_use]
    pub fn with_role(mut self, role: Role) -> Self {
        self.required_role = Some(role);
        self
    }
}

/// Reasons an action was denied.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("{action} requires role {required}")]
    InsufficientRole { action: Action, required: Role },

    #[error("{action} is restricted to the owner")]
    NotOwner { action: Action },

    #[error("{action} requires an authenticated identity")]
    Unauthenticated { action: Action },
}

impl AuthzError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientRole { .. } => "insufficient_role",
            Self::NotOwner { .. } => "not_owner",
            Self::Unauthenticated { .. } => "unauthenticated",
        }
    }
}

/// Proof that an action was allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    /// The acting identity, if the caller is authenticated.
    pub actor: Option<UserId>,
    /// Set when the action passed only through relaxed ownership.
    pub relaxed: bool,
}

/// Decides whether `claims` may perform `action` under `rule`.
///
/// The role requirement is checked before ownership, so a caller lacking the
/// role gets [`AuthzError::InsufficientRole`] even when they also are not the
/// owner.
///
/// # Example
///
/// ```rust
/// use pb_realtime::guard::{authorize, AccessRule, Action, AuthzError};
/// use pb_realtime::types::UserId;
///
/// let rule = AccessRule::owner(UserId::new());
/// let err = authorize(None, Action::Publish, &rule).unwrap_err();
/// assert!(matches!(err, AuthzError::Unauthenticated { .. }));
/// ```
pub fn authorize(
    claims: Option<&Claims>,
    action: Action,
    rule: &AccessRule,
) -> Result<Grant, AuthzError> {
    if let Some(required) = &rule.required_role {
        let claims = claims.ok_or(AuthzError::Unauthenticated { action })?;
        if !claims.has_role(required) {
            return Err(AuthzError::InsufficientRole {
                action,
                required: required.clone(),
            });
        }
    }

    match &rule.ownership {
        Ownership::Unrestricted => Ok(Grant {
            actor: claims.map(|c| c.user_id),
            relaxed: false,
        }),
        Ownership::Owner(owner) => {
            let claims = claims.ok_or(AuthzError::Unauthenticated { action })?;
            if claims.user_id != *owner {
                return Err(AuthzError::NotOwner { action });
            }
            Ok(Grant {
                actor: Some(claims.user_id),
                relaxed: false,
            })
        }
        Ownership::Relaxed => {
            let claims = claims.ok_or(AuthzError::Unauthenticated { action })?;
            debug!(
                actor = %claims.user_id,
                action = %action,
                "Allowed under relaxed ownership"
            );
            Ok(Grant {
                actor: Some(claims.user_id),
                relaxed: true,
            })
        }
    }
}

impl Topic {
    /// Access rule for `action` on this topic.
    ///
    /// | Kind | Subscribe | Publish |
    /// |------|-----------|---------|
    /// | `game:` | anyone | any authenticated user (relaxed) |
    /// | `user:` | owner only | owner only |
    /// | `admin:` | `ADMIN` role | `ADMIN` role |
    pub fn access_rule(&self, action: Action) -> AccessRule {
        match (self.kind(), action) {
            (TopicKind::Game, Action::Subscribe) => AccessRule::open(),
            (TopicKind::Game, _) => AccessRule::relaxed(),
            (TopicKind::User(owner), _) => AccessRule::owner(owner),
            (TopicKind::Admin, _) => AccessRule::role(Role::Admin),
        }
    }
}
