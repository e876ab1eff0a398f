//! Auth session model.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::notes::CoreNote;
use crate::AuthResult;
use crate::error::AuthError;

/// Server-side state of one in-progress login or linking flow.
///
/// All cross-request state lives in the three note maps:
///
/// - `notes` - auth notes, shared by the flow core and the flow executor
/// - `client_notes` - protocol parameters of the application request
/// - `user_session_notes` - copied to the user session on completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    /// Session id. Equal to the browser session id on the cookie path.
    pub id: String,

    /// Client the flow runs for.
    pub client_id: String,

    /// Where the flow returns on success.
    pub redirect_uri: Option<String>,

    /// Login protocol of the client.
    pub protocol: String,

    notes: BTreeMap<String, String>,
    client_notes: BTreeMap<String, String>,
    user_session_notes: BTreeMap<String, String>,
    authenticated_user: Option<String>,

    /// Required actions pending for this flow.
    pub required_actions: BTreeSet<String>,

    /// When the session was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,

    /// Last write, used for the expiry sweep.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl AuthSession {
    /// Creates an empty session for `client_id`.
    #[must_use]
    pub fn new(id: impl Into<String>, client_id: impl Into<String>, now: OffsetDateTime) -> Self {
        Self {
            id: id.into(),
            client_id: client_id.into(),
            redirect_uri: None,
            protocol: "openid-connect".to_string(),
            notes: BTreeMap::new(),
            client_notes: BTreeMap::new(),
            user_session_notes: BTreeMap::new(),
            authenticated_user: None,
            required_actions: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a session with a random id.
    #[must_use]
    pub fn generate(client_id: impl Into<String>, now: OffsetDateTime) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), client_id, now)
    }

    // ---- auth notes -------------------------------------------------------

    #[must_use]
    pub fn note(&self, name: &str) -> Option<&str> {
        self.notes.get(name).map(String::as_str)
    }

    pub fn set_note(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.notes.insert(name.into(), value.into());
    }

    pub fn remove_note(&mut self, name: &str) -> Option<String> {
        self.notes.remove(name)
    }

    /// Returns all auth notes.
    #[must_use]
    pub fn notes(&self) -> &BTreeMap<String, String> {
        &self.notes
    }

    // ---- client notes -----------------------------------------------------

    #[must_use]
    pub fn client_note(&self, name: &str) -> Option<&str> {
        self.client_notes.get(name).map(String::as_str)
    }

    pub fn set_client_note(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.client_notes.insert(name.into(), value.into());
    }

    // ---- user session notes -----------------------------------------------

    #[must_use]
    pub fn user_session_note(&self, name: &str) -> Option<&str> {
        self.user_session_notes.get(name).map(String::as_str)
    }

    pub fn set_user_session_note(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.user_session_notes.insert(name.into(), value.into());
    }

    /// Returns the notes copied to the user session on completion.
    #[must_use]
    pub fn user_session_notes(&self) -> &BTreeMap<String, String> {
        &self.user_session_notes
    }

    // ---- authenticated user -----------------------------------------------

    /// Returns the id of the user authenticated so far.
    #[must_use]
    pub fn authenticated_user(&self) -> Option<&str> {
        self.authenticated_user.as_deref()
    }

    /// Records the authenticated user.
    ///
    /// Setting the same user again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::SessionHijackSuspected` if a different user is
    /// already authenticated in this session.
    pub fn set_authenticated_user(&mut self, user_id: &str) -> AuthResult<()> {
        match self.authenticated_user.as_deref() {
            Some(current) if current != user_id => {
                tracing::warn!(
                    session_id = %self.id,
                    current = %current,
                    requested = %user_id,
                    "Refusing to replace authenticated user"
                );
                Err(AuthError::SessionHijackSuspected)
            }
            Some(_) => Ok(()),
            None => {
                self.authenticated_user = Some(user_id.to_string());
                Ok(())
            }
        }
    }

    // ---- flow -------------------------------------------------------------

    /// Returns the path of the flow currently running.
    #[must_use]
    pub fn flow_path(&self) -> Option<&str> {
        self.core_note(CoreNote::CurrentFlowPath)
    }

    /// Restarts the flow at `flow_path`.
    ///
    /// Clears the authenticated user, every auth note, the user session
    /// notes and the pending required actions. Client notes survive, they
    /// describe the application request.
    pub fn reset_flow(&mut self, flow_path: &str) {
        self.authenticated_user = None;
        self.notes.clear();
        self.user_session_notes.clear();
        self.required_actions.clear();
        self.set_core_note(CoreNote::CurrentFlowPath, flow_path);
    }

    /// Returns `true` if the session was not written for `lifespan`.
    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime, lifespan: std::time::Duration) -> bool {
        let lifespan = time::Duration::try_from(lifespan).unwrap_or(time::Duration::MAX);
        now - self.updated_at > lifespan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> AuthSession {
        AuthSession::new("s1", "portal", OffsetDateTime::UNIX_EPOCH)
    }

    #[test]
    fn test_authenticated_user_cannot_be_silently_replaced() {
        let mut session = session();
        session.set_authenticated_user("alice").unwrap();
        session.set_authenticated_user("alice").unwrap();

        assert_eq!(
            session.set_authenticated_user("bob").unwrap_err(),
            AuthError::SessionHijackSuspected
        );
        assert_eq!(session.authenticated_user(), Some("alice"));
    }

    #[test]
    fn test_reset_flow_clears_progress() {
        let mut session = session();
        session.set_authenticated_user("alice").unwrap();
        session.set_note("custom", "x");
        session.set_client_note("state", "abc");
        session.set_user_session_note("identity_provider", "github");
        session.required_actions.insert("VERIFY_EMAIL".to_string());

        session.reset_flow("authenticate");

        assert_eq!(session.authenticated_user(), None);
        assert_eq!(session.note("custom"), None);
        assert_eq!(session.user_session_note("identity_provider"), None);
        assert!(session.required_actions.is_empty());
        assert_eq!(session.client_note("state"), Some("abc"));
        assert_eq!(session.flow_path(), Some("authenticate"));
    }

    #[test]
    fn test_expiry() {
        let session = session();
        let lifespan = std::time::Duration::from_secs(60);
        assert!(!session.is_expired(OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(60), lifespan));
        assert!(session.is_expired(OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(61), lifespan));
    }

    #[test]
    fn test_serde_roundtrip_keeps_notes() {
        let mut session = session();
        session.set_note("a", "1");
        session.set_authenticated_user("alice").unwrap();

        let json = serde_json::to_string(&session).unwrap();
        let back: AuthSession = serde_json::from_str(&json).unwrap();
        assert_eq!(back, session);
    }
}
