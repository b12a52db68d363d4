//! User accounts, password verification and login.
//!
//! Accounts live behind the [`IdentityStore`] trait; [`MemoryIdentityStore`]
//! is the in-process implementation. [`Authenticator`] combines a store,
//! Argon2id password hashing and the [`TokenService`] into the login and
//! registration flows. [`RoleCatalog`] holds the role names administrators
//! can manage.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, IssuedToken, TokenService};
use crate::types::{Identity, Role, RoleSet, UserId};

/// Username of the account seeded at startup.
pub const ADMIN_USERNAME: &str = "admin";

const ADMIN_EMAIL: &str = "admin@localhost";
const MIN_USERNAME_LENGTH: usize = 3;
const MAX_USERNAME_LENGTH: usize = 32;
const MIN_PASSWORD_LENGTH: usize = 8;

/// Hashed once and checked against for unknown usernames.
const UNKNOWN_USER_PASSWORD: &str = "unknown-user-placeholder";

/// Errors raised by account management.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("username '{0}' is already taken")]
    UsernameTaken(String),

    #[error("email '{0}' is already registered")]
    EmailTaken(String),

    #[error("user {0} not found")]
    NotFound(UserId),

    #[error("{0}")]
    Invalid(String),

    #[error("password hashing failed: {0}")]
    Hashing(String),

    #[error("role '{0}' already exists")]
    RoleExists(Role),

    #[error("role '{0}' not found")]
    RoleNotFound(String),
}

impl IdentityError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UsernameTaken(_) => "username_taken",
            Self::EmailTaken(_) => "email_taken",
            Self::NotFound(_) => "user_not_found",
            Self::Invalid(_) => "invalid_request",
            Self::Hashing(_) => "internal_error",
            Self::RoleExists(_) => "role_exists",
            Self::RoleNotFound(_) => "role_not_found",
        }
    }
}

/// A stored account.
#[derive(Debug, Clone)]
pub struct Account {
    pub identity: Identity,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

/// Input for [`IdentityStore::create`]. The password is already hashed.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub roles: RoleSet,
}

/// Storage for user accounts.
pub trait IdentityStore: Send + Sync {
    fn find_by_id(&self, id: UserId) -> Option<Account>;

    fn find_by_username(&self, username: &str) -> Option<Account>;

    /// Looks an account up by email, ignoring ASCII case.
    fn find_by_email(&self, email: &str) -> Option<Account>;

    /// Public profiles of every account, ordered by username.
    fn list(&self) -> Vec<Identity>;

    /// Creates an account with a fresh id.
    ///
    /// # Errors
    ///
    /// Fails with [`IdentityError::UsernameTaken`] or
    /// [`IdentityError::EmailTaken`] on duplicates.
    fn create(&self, account: NewAccount) -> Result<Identity, IdentityError>;

    fn record_login(&self, id: UserId, at: DateTime<Utc>) -> Result<(), IdentityError>;

    /// Replaces the roles of an account.
    fn set_roles(&self, id: UserId, roles: RoleSet) -> Result<Identity, IdentityError>;

    /// Removes an account, freeing its username and email.
    fn delete(&self, id: UserId) -> Result<Identity, IdentityError>;
}

fn email_key(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

#[derive(Debug, Default)]
struct Accounts {
    by_id: HashMap<UserId, Account>,
    by_username: HashMap<String, UserId>,
    by_email: HashMap<String, UserId>,
}

/// In-process account store.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    accounts: RwLock<Accounts>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.accounts.read().expect("account lock poisoned").by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn find_by_id(&self, id: UserId) -> Option<Account> {
        let accounts = self.accounts.read().expect("account lock poisoned");
        accounts.by_id.get(&id).cloned()
    }

    fn find_by_username(&self, username: &str) -> Option<Account> {
        let accounts = self.accounts.read().expect("account lock poisoned");
        let id = accounts.by_username.get(username)?;
        accounts.by_id.get(id).cloned()
    }

    fn find_by_email(&self, email: &str) -> Option<Account> {
        let accounts = self.accounts.read().expect("account lock poisoned");
        let id = accounts.by_email.get(&email_key(email))?;
        accounts.by_id.get(id).cloned()
    }

    fn list(&self) -> Vec<Identity> {
        let accounts = self.accounts.read().expect("account lock poisoned");
        let mut identities: Vec<Identity> = accounts
            .by_id
            .values()
            .map(|account| account.identity.clone())
            .collect();
        identities.sort_by(|a, b| a.username.cmp(&b.username));
        identities
    }

    fn create(&self, account: NewAccount) -> Result<Identity, IdentityError> {
        let mut accounts = self.accounts.write().expect("account lock poisoned");
        let email_key = email_key(&account.email);

        if accounts.by_username.contains_key(&account.username) {
            return Err(IdentityError::UsernameTaken(account.username));
        }
        if accounts.by_email.contains_key(&email_key) {
            return Err(IdentityError::EmailTaken(account.email));
        }

        let identity = Identity {
            id: UserId::new(),
            username: account.username,
            email: account.email,
            roles: account.roles,
        };

        accounts
            .by_username
            .insert(identity.username.clone(), identity.id);
        accounts.by_email.insert(email_key, identity.id);
        accounts.by_id.insert(
            identity.id,
            Account {
                identity: identity.clone(),
                password_hash: account.password_hash,
                created_at: Utc::now(),
                last_login: None,
            },
        );

        Ok(identity)
    }

    fn record_login(&self, id: UserId, at: DateTime<Utc>) -> Result<(), IdentityError> {
        let mut accounts = self.accounts.write().expect("account lock poisoned");
        let account = accounts
            .by_id
            .get_mut(&id)
            .ok_or(IdentityError::NotFound(id))?;
        account.last_login = Some(at);
        Ok(())
    }

    fn set_roles(&self, id: UserId, roles: RoleSet) -> Result<Identity, IdentityError> {
        let mut accounts = self.accounts.write().expect("account lock poisoned");
        let account = accounts
            .by_id
            .get_mut(&id)
            .ok_or(IdentityError::NotFound(id))?;
        account.identity.roles = roles;
        Ok(account.identity.clone())
    }

    fn delete(&self, id: UserId) -> Result<Identity, IdentityError> {
        let mut accounts = self.accounts.write().expect("account lock poisoned");
        let account = accounts
            .by_id
            .remove(&id)
            .ok_or(IdentityError::NotFound(id))?;
        accounts.by_username.remove(&account.identity.username);
        accounts.by_email.remove(&email_key(&account.identity.email));
        Ok(account.identity)
    }
}

/// Role names that can be assigned to accounts.
///
/// Starts with the built-in `ADMIN`, `USER` and `DEV` roles, which cannot be
/// removed. Names are normalised by [`Role::parse`].
#[derive(Debug)]
pub struct RoleCatalog {
    roles: RwLock<BTreeSet<Role>>,
}

impl RoleCatalog {
    pub fn new() -> Self {
        Self {
            roles: RwLock::new([Role::Admin, Role::User, Role::Dev].into_iter().collect()),
        }
    }

    pub fn list(&self) -> Vec<Role> {
        let roles = self.roles.read().expect("role lock poisoned");
        roles.iter().cloned().collect()
    }

    pub fn contains(&self, role: &Role) -> bool {
        self.roles.read().expect("role lock poisoned").contains(role)
    }

    /// Adds a role.
    ///
    /// # Errors
    ///
    /// [`IdentityError::Invalid`] for a malformed name,
    /// [`IdentityError::RoleExists`] if it is already present.
    pub fn create(&self, name: &str) -> Result<Role, IdentityError> {
        let role = Role::parse(name).map_err(|e| IdentityError::Invalid(e.to_string()))?;
        let mut roles = self.roles.write().expect("role lock poisoned");
        if !roles.insert(role.clone()) {
            return Err(IdentityError::RoleExists(role));
        }
        Ok(role)
    }

    /// Removes a custom role. Accounts holding it keep it.
    pub fn delete(&self, name: &str) -> Result<Role, IdentityError> {
        let role = Role::parse(name).map_err(|_| IdentityError::RoleNotFound(name.to_string()))?;
        if !matches!(role, Role::Custom(_)) {
            return Err(IdentityError::Invalid(format!(
                "built-in role '{role}' cannot be removed"
            )));
        }
        let mut roles = self.roles.write().expect("role lock poisoned");
        if !roles.remove(&role) {
            return Err(IdentityError::RoleNotFound(role.as_str().to_string()));
        }
        Ok(role)
    }
}

impl Default for RoleCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Argon2id password hashing.
#[derive(Clone, Default)]
pub struct Passwords {
    argon2: Argon2<'static>,
}

impl Passwords {
    /// Argon2id with explicit cost parameters.
    pub fn with_params(params: Params) -> Self {
        Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        }
    }

    pub fn hash(&self, password: &str) -> Result<String, IdentityError> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| IdentityError::Hashing(e.to_string()))
    }

    /// Returns `true` if `password` matches the PHC-encoded `hash`.
    pub fn verify(&self, password: &str, hash: &str) -> bool {
        match PasswordHash::new(hash) {
            Ok(parsed) => self
                .argon2
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(err) => {
                warn!(error = %err, "Stored password hash is unreadable");
                false
            }
        }
    }
}

impl fmt::Debug for Passwords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passwords(argon2id)")
    }
}

/// Result of a successful login.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub identity: Identity,
    pub token: IssuedToken,
}

/// Login, registration and admin seeding.
#[derive(Clone)]
pub struct Authenticator {
    store: Arc<dyn IdentityStore>,
    tokens: Arc<TokenService>,
    passwords: Passwords,
    unknown_user_hash: Arc<OnceLock<String>>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn IdentityStore>, tokens: Arc<TokenService>, passwords: Passwords) -> Self {
        Self {
            store,
            tokens,
            passwords,
            unknown_user_hash: Arc::new(OnceLock::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn IdentityStore> {
        &self.store
    }

    /// Verifies credentials and issues a token carrying the account's roles.
    ///
    /// Updates the last-login time as a side effect; failing to do so does
    /// not fail the login.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidCredentials`] for an unknown username or a wrong
    /// password. Both cases run one Argon2 verification.
    pub fn login(&self, username: &str, password: &str) -> Result<LoginOutcome, AuthError> {
        let Some(account) = self.store.find_by_username(username) else {
            let _ = self.passwords.verify(password, self.unknown_user_hash());
            debug!(username, "Login for unknown username");
            return Err(AuthError::InvalidCredentials);
        };

        if !self.passwords.verify(password, &account.password_hash) {
            debug!(user_id = %account.identity.id, "Login with wrong password");
            return Err(AuthError::InvalidCredentials);
        }

        let identity = account.identity;
        let token = self.tokens.issue(&identity, &identity.roles)?;

        if let Err(err) = self.store.record_login(identity.id, Utc::now()) {
            warn!(user_id = %identity.id, error = %err, "Failed to record login time");
        }

        info!(user_id = %identity.id, username = %identity.username, "User logged in");
        Ok(LoginOutcome { identity, token })
    }

    fn unknown_user_hash(&self) -> &str {
        self.unknown_user_hash.get_or_init(|| {
            self.passwords
                .hash(UNKNOWN_USER_PASSWORD)
                .unwrap_or_else(|err| {
                    warn!(error = %err, "Failed to hash unknown-user placeholder");
                    String::new()
                })
        })
    }

    /// Creates a new account with the `USER` role.
    pub fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<Identity, IdentityError> {
        validate_registration(username, email, password)?;
        self.create_account(username, email, password, [Role::User].into_iter().collect())
    }

    /// Ensures an `admin` account exists, creating it with `password` if not.
    pub fn seed_admin(&self, password: &str) -> Result<Identity, IdentityError> {
        if let Some(existing) = self.store.find_by_username(ADMIN_USERNAME) {
            debug!(user_id = %existing.identity.id, "Admin account already present");
            return Ok(existing.identity);
        }

        let roles = [Role::Admin, Role::User].into_iter().collect();
        let identity = self.create_account(ADMIN_USERNAME, ADMIN_EMAIL, password, roles)?;
        info!(user_id = %identity.id, "Seeded admin account");
        Ok(identity)
    }

    fn create_account(
        &self,
        username: &str,
        email: &str,
        password: &str,
        roles: RoleSet,
    ) -> Result<Identity, IdentityError> {
        let password_hash = self.passwords.hash(password)?;
        let identity = self.store.create(NewAccount {
            username: username.to_string(),
            email: email.trim().to_string(),
            password_hash,
            roles,
        })?;
        info!(user_id = %identity.id, username = %identity.username, "Account created");
        Ok(identity)
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("tokens", &self.tokens)
            .field("passwords", &self.passwords)
            .finish_non_exhaustive()
    }
}

fn validate_registration(username: &str, email: &str, password: &str) -> Result<(), IdentityError> {
    let length = username.chars().count();
    if !(MIN_USERNAME_LENGTH..=MAX_USERNAME_LENGTH).contains(&length) {
        return Err(IdentityError::Invalid(format!(
            "username must be {MIN_USERNAME_LENGTH}-{MAX_USERNAME_LENGTH} characters"
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(IdentityError::Invalid(
            "username may only contain letters, digits, '_', '-' and '.'".to_string(),
        ));
    }

    let email = email.trim();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {}
        _ => return Err(IdentityError::Invalid("email address is invalid".to_string())),
    }

    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(IdentityError::Invalid(format!(
            "password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }

    Ok(())
}
