//! Users and federated identity links.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::AuthResult;
use crate::error::AuthError;

/// Role allowing a user to manage their own account.
pub const MANAGE_ACCOUNT_ROLE: &str = "manage-account";

/// Role allowing a user to manage only their identity provider links.
pub const MANAGE_ACCOUNT_LINKS_ROLE: &str = "manage-account-links";

/// Role allowing a user to read tokens stored for their provider links.
pub const READ_TOKEN_ROLE: &str = "read-token";

/// Required action asking the user to verify their e-mail address.
pub const VERIFY_EMAIL_ACTION: &str = "VERIFY_EMAIL";

// ============================================================================
// Models
// ============================================================================

/// A local user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub enabled: bool,
    /// Granted realm and account roles.
    pub roles: BTreeSet<String>,
    /// Required actions the user must complete on next login.
    pub required_actions: BTreeSet<String>,
}

impl User {
    /// Creates an enabled user with a random id.
    #[must_use]
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.into(),
            email: None,
            email_verified: false,
            first_name: None,
            last_name: None,
            enabled: true,
            roles: BTreeSet::new(),
            required_actions: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// Persisted link between an external identity and a local user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederatedIdentityLink {
    /// Alias of the identity provider.
    pub provider_alias: String,
    /// Stable subject id at the provider.
    pub external_id: String,
    /// Username at the provider.
    pub external_username: Option<String>,
    /// Linked local user.
    pub user_id: String,
    /// Stored provider token, when the provider stores tokens.
    pub token: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub linked_at: OffsetDateTime,
}

// ============================================================================
// Storage Trait
// ============================================================================

/// Storage trait for users and their federated identities.
///
/// Links are unique per `(provider, external id)` and per
/// `(provider, user id)`; both constraints hold at all times.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Finds a user by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn get_user(&self, id: &str) -> AuthResult<Option<User>>;

    /// Finds a user by username (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn find_user_by_username(&self, username: &str) -> AuthResult<Option<User>>;

    /// Finds a user by e-mail address (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn find_user_by_email(&self, email: &str) -> AuthResult<Option<User>>;

    /// Stores a new user.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidRequest` if the id or username is taken.
    async fn add_user(&self, user: &User) -> AuthResult<()>;

    /// Replaces an existing user.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidUser` if the user does not exist.
    async fn update_user(&self, user: &User) -> AuthResult<()>;

    /// Finds the user linked to an external identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn find_user_by_federated_identity(
        &self,
        provider_alias: &str,
        external_id: &str,
    ) -> AuthResult<Option<User>>;

    /// Returns the link of `user_id` to `provider_alias`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn get_federated_identity(
        &self,
        user_id: &str,
        provider_alias: &str,
    ) -> AuthResult<Option<FederatedIdentityLink>>;

    /// Adds a link.
    ///
    /// # Atomicity
    ///
    /// Both uniqueness constraints are checked and the link inserted under
    /// one write lock.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::AlreadyLinked` if the external identity is linked
    /// to another user or the user already has a link to this provider.
    async fn add_federated_identity(&self, link: &FederatedIdentityLink) -> AuthResult<()>;

    /// Replaces the stored token and username of an existing link.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidRequest` if the link does not exist.
    async fn update_federated_identity(&self, link: &FederatedIdentityLink) -> AuthResult<()>;

    /// Returns all links of a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn federated_identities(&self, user_id: &str) -> AuthResult<Vec<FederatedIdentityLink>>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Default)]
struct Inner {
    users: HashMap<String, User>,
    /// `(provider, external id)` -> link
    links: HashMap<(String, String), FederatedIdentityLink>,
    /// `(provider, user id)` -> external id
    links_by_user: HashMap<(String, String), String>,
}

/// In-memory identity store.
#[derive(Default)]
pub struct InMemoryIdentityStore {
    inner: RwLock<Inner>,
}

impl InMemoryIdentityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored links.
    pub async fn link_count(&self) -> usize {
        self.inner.read().await.links.len()
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn get_user(&self, id: &str) -> AuthResult<Option<User>> {
        Ok(self.inner.read().await.users.get(id).cloned())
    }

    async fn find_user_by_username(&self, username: &str) -> AuthResult<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .values()
            .find(|u| u.username.eq_ignore_ascii_case(username))
            .cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> AuthResult<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .values()
            .find(|u| u.email.as_deref().is_some_and(|e| e.eq_ignore_ascii_case(email)))
            .cloned())
    }

    async fn add_user(&self, user: &User) -> AuthResult<()> {
        let mut inner = self.inner.write().await;
        if inner.users.contains_key(&user.id) {
            return Err(AuthError::invalid_request(format!(
                "user id {} already exists",
                user.id
            )));
        }
        if inner
            .users
            .values()
            .any(|u| u.username.eq_ignore_ascii_case(&user.username))
        {
            return Err(AuthError::invalid_request(format!(
                "username {} already exists",
                user.username
            )));
        }
        inner.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn update_user(&self, user: &User) -> AuthResult<()> {
        let mut inner = self.inner.write().await;
        match inner.users.get_mut(&user.id) {
            Some(stored) => {
                *stored = user.clone();
                Ok(())
            }
            None => Err(AuthError::invalid_user(format!("user {} not found", user.id))),
        }
    }

    async fn find_user_by_federated_identity(
        &self,
        provider_alias: &str,
        external_id: &str,
    ) -> AuthResult<Option<User>> {
        let inner = self.inner.read().await;
        let key = (provider_alias.to_string(), external_id.to_string());
        Ok(inner
            .links
            .get(&key)
            .and_then(|link| inner.users.get(&link.user_id))
            .cloned())
    }

    async fn get_federated_identity(
        &self,
        user_id: &str,
        provider_alias: &str,
    ) -> AuthResult<Option<FederatedIdentityLink>> {
        let inner = self.inner.read().await;
        let Some(external_id) = inner
            .links_by_user
            .get(&(provider_alias.to_string(), user_id.to_string()))
        else {
            return Ok(None);
        };
        Ok(inner
            .links
            .get(&(provider_alias.to_string(), external_id.clone()))
            .cloned())
    }

    async fn add_federated_identity(&self, link: &FederatedIdentityLink) -> AuthResult<()> {
        let mut inner = self.inner.write().await;
        let by_external = (link.provider_alias.clone(), link.external_id.clone());
        let by_user = (link.provider_alias.clone(), link.user_id.clone());

        if inner.links.contains_key(&by_external) || inner.links_by_user.contains_key(&by_user) {
            return Err(AuthError::already_linked(&link.provider_alias));
        }
        if !inner.users.contains_key(&link.user_id) {
            return Err(AuthError::invalid_user(format!(
                "user {} not found",
                link.user_id
            )));
        }

        inner
            .links_by_user
            .insert(by_user, link.external_id.clone());
        inner.links.insert(by_external, link.clone());
        Ok(())
    }

    async fn update_federated_identity(&self, link: &FederatedIdentityLink) -> AuthResult<()> {
        let mut inner = self.inner.write().await;
        let key = (link.provider_alias.clone(), link.external_id.clone());
        match inner.links.get_mut(&key) {
            Some(stored) if stored.user_id == link.user_id => {
                stored.token = link.token.clone();
                stored.external_username = link.external_username.clone();
                Ok(())
            }
            _ => Err(AuthError::invalid_request(format!(
                "no link of user {} to {}",
                link.user_id, link.provider_alias
            ))),
        }
    }

    async fn federated_identities(&self, user_id: &str) -> AuthResult<Vec<FederatedIdentityLink>> {
        let inner = self.inner.read().await;
        let mut links: Vec<_> = inner
            .links
            .values()
            .filter(|l| l.user_id == user_id)
            .cloned()
            .collect();
        links.sort_by(|a, b| a.provider_alias.cmp(&b.provider_alias));
        Ok(links)
    }
}
