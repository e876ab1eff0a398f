//! Logged-in user sessions.
//!
//! A user session is created when a flow completes and is addressed by the
//! identity cookie. It holds one client session per application the user
//! logged in to; the roles granted to that client session decide what the
//! application may ask for on the user's behalf.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::AuthResult;
use crate::error::AuthError;

/// A user's login at one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSession {
    pub client_id: String,
    /// Roles granted to the client for this login.
    pub roles: BTreeSet<String>,
    pub redirect_uri: Option<String>,
}

impl ClientSession {
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            roles: BTreeSet::new(),
            redirect_uri: None,
        }
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

/// A logged-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSession {
    pub id: String,
    pub user_id: String,
    pub notes: BTreeMap<String, String>,
    /// Client sessions keyed by client id.
    pub client_sessions: BTreeMap<String, ClientSession>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

impl UserSession {
    #[must_use]
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, now: OffsetDateTime) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            notes: BTreeMap::new(),
            client_sessions: BTreeMap::new(),
            started_at: now,
        }
    }

    #[must_use]
    pub fn with_client_session(mut self, client_session: ClientSession) -> Self {
        self.client_sessions
            .insert(client_session.client_id.clone(), client_session);
        self
    }

    #[must_use]
    pub fn note(&self, name: &str) -> Option<&str> {
        self.notes.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn client_session(&self, client_id: &str) -> Option<&ClientSession> {
        self.client_sessions.get(client_id)
    }
}

/// Storage trait for user sessions.
#[async_trait]
pub trait UserSessionStore: Send + Sync {
    /// Stores a user session, replacing one with the same id.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn create(&self, session: &UserSession) -> AuthResult<()>;

    /// Finds a user session by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn get(&self, id: &str) -> AuthResult<Option<UserSession>>;

    /// Writes back a modified user session.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the session no longer exists.
    async fn update(&self, session: &UserSession) -> AuthResult<()>;

    /// Removes a user session (logout).
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn remove(&self, id: &str) -> AuthResult<bool>;
}

/// In-memory user session store.
#[derive(Debug, Default)]
pub struct InMemoryUserSessionStore {
    sessions: DashMap<String, UserSession>,
}

impl InMemoryUserSessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserSessionStore for InMemoryUserSessionStore {
    async fn create(&self, session: &UserSession) -> AuthResult<()> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> AuthResult<Option<UserSession>> {
        Ok(self.sessions.get(id).map(|s| s.clone()))
    }

    async fn update(&self, session: &UserSession) -> AuthResult<()> {
        match self.sessions.get_mut(&session.id) {
            Some(mut stored) => {
                *stored = session.clone();
                Ok(())
            }
            None => Err(AuthError::storage(format!(
                "user session {} no longer exists",
                session.id
            ))),
        }
    }

    async fn remove(&self, id: &str) -> AuthResult<bool> {
        Ok(self.sessions.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_user_session_roundtrip() {
        let store = InMemoryUserSessionStore::new();
        let session = UserSession::new("us-1", "user-1", OffsetDateTime::UNIX_EPOCH)
            .with_client_session(ClientSession::new("portal").with_role("manage-account-links"));
        store.create(&session).await.unwrap();

        let mut loaded = store.get("us-1").await.unwrap().unwrap();
        assert!(
            loaded
                .client_session("portal")
                .unwrap()
                .has_role("manage-account-links")
        );
        assert!(loaded.client_session("other").is_none());

        loaded
            .notes
            .insert("identity_provider".to_string(), "github".to_string());
        store.update(&loaded).await.unwrap();
        assert_eq!(
            store.get("us-1").await.unwrap().unwrap().note("identity_provider"),
            Some("github")
        );

        assert!(store.remove("us-1").await.unwrap());
        assert!(store.update(&loaded).await.is_err());
    }
}
