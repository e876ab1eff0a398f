//! Brokered identity context and its carrier.
//!
//! The context is what an external provider asserted about the user. While
//! the first or post broker login flow runs it is parked on the auth session
//! as JSON under a stage-specific note, and read back when the flow reports
//! completion.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::AuthResult;
use crate::error::AuthError;
use crate::session::{AuthSession, CoreNote, FIRST_BROKER_LOGIN_PATH, POST_BROKER_LOGIN_PATH};
use crate::store::FederatedIdentityLink;

/// Broker sub-flow a context is parked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerStage {
    /// The external identity has no local user yet.
    FirstLogin,
    /// Runs after every login through a provider that configures it.
    PostLogin,
}

impl BrokerStage {
    /// Note holding the serialized context.
    #[must_use]
    pub fn context_note(&self) -> CoreNote {
        match self {
            Self::FirstLogin => CoreNote::FirstBrokerContext,
            Self::PostLogin => CoreNote::PostBrokerContext,
        }
    }

    /// Flow path recorded on the session.
    #[must_use]
    pub fn flow_path(&self) -> &'static str {
        match self {
            Self::FirstLogin => FIRST_BROKER_LOGIN_PATH,
            Self::PostLogin => POST_BROKER_LOGIN_PATH,
        }
    }
}

/// Identity asserted by an external provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokeredIdentityContext {
    /// Alias of the provider that asserted the identity.
    pub provider_alias: String,
    /// Stable subject id at the provider.
    pub id: String,
    /// Username at the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Local username chosen for the identity, when a mapper set one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    /// Raw provider token. Dropped unless the provider stores tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_user_id: Option<String>,
    /// Provider-specific attributes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl BrokeredIdentityContext {
    #[must_use]
    pub fn new(provider_alias: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            provider_alias: provider_alias.into(),
            id: id.into(),
            username: None,
            model_username: None,
            email: None,
            first_name: None,
            last_name: None,
            token: None,
            broker_session_id: None,
            broker_user_id: None,
            attributes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Chooses the local username for a first login.
    ///
    /// Preference: a mapper-provided username, the e-mail address when the
    /// realm registers by e-mail, the provider username, and finally
    /// `<alias>.<id>`. The result is trimmed.
    #[must_use]
    pub fn canonical_username(&self, email_as_username: bool) -> String {
        let email = self.email.as_deref().filter(|e| !e.trim().is_empty());
        let chosen = match (&self.model_username, email, &self.username) {
            (Some(model), _, _) => model.clone(),
            (None, Some(email), _) if email_as_username => email.to_string(),
            (None, _, Some(username)) => username.clone(),
            _ => format!("{}.{}", self.provider_alias, self.id),
        };
        chosen.trim().to_string()
    }

    /// Builds the link record for `user_id`.
    #[must_use]
    pub fn to_link(&self, user_id: &str, now: OffsetDateTime) -> FederatedIdentityLink {
        FederatedIdentityLink {
            provider_alias: self.provider_alias.clone(),
            external_id: self.id.clone(),
            external_username: self.username.clone(),
            user_id: user_id.to_string(),
            token: self.token.clone(),
            linked_at: now,
        }
    }

    // ---- carrier ----------------------------------------------------------

    /// Parks the context on `session` for `stage`.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Internal` if the context cannot be serialized.
    pub fn save(&self, session: &mut AuthSession, stage: BrokerStage) -> AuthResult<()> {
        let json = serde_json::to_string(self).map_err(|e| {
            AuthError::internal(format!("failed to serialize brokered context: {e}"))
        })?;
        session.set_core_note(stage.context_note(), json);
        Ok(())
    }

    /// Reads the context parked for `stage`.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidRequest` if the note does not hold a context.
    pub fn load(session: &AuthSession, stage: BrokerStage) -> AuthResult<Option<Self>> {
        session
            .core_note(stage.context_note())
            .map(|json| {
                serde_json::from_str(json).map_err(|e| {
                    AuthError::invalid_request(format!("corrupt brokered context: {e}"))
                })
            })
            .transpose()
    }

    /// Removes the context parked for `stage`.
    pub fn remove(session: &mut AuthSession, stage: BrokerStage) {
        session.remove_core_note(stage.context_note());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_username_preference() {
        let base = BrokeredIdentityContext::new("github", "12345");
        assert_eq!(base.canonical_username(false), "github.12345");

        let with_username = base.clone().with_username("  octocat ");
        assert_eq!(with_username.canonical_username(false), "octocat");

        let with_email = with_username.clone().with_email("cat@example.com");
        assert_eq!(with_email.canonical_username(false), "octocat");
        assert_eq!(with_email.canonical_username(true), "cat@example.com");

        let blank_email = with_username.clone().with_email("  ");
        assert_eq!(blank_email.canonical_username(true), "octocat");

        let mut mapped = with_email;
        mapped.model_username = Some("mapped".to_string());
        assert_eq!(mapped.canonical_username(true), "mapped");
    }

    #[test]
    fn test_carrier_roundtrip_per_stage() {
        let mut session = AuthSession::new("s1", "portal", OffsetDateTime::UNIX_EPOCH);
        let ctx = BrokeredIdentityContext::new("github", "12345")
            .with_username("octocat")
            .with_token("tok");

        ctx.save(&mut session, BrokerStage::FirstLogin).unwrap();
        assert_eq!(
            BrokeredIdentityContext::load(&session, BrokerStage::FirstLogin).unwrap(),
            Some(ctx)
        );
        assert_eq!(
            BrokeredIdentityContext::load(&session, BrokerStage::PostLogin).unwrap(),
            None
        );

        BrokeredIdentityContext::remove(&mut session, BrokerStage::FirstLogin);
        assert!(session.core_note(CoreNote::FirstBrokerContext).is_none());
    }

    #[test]
    fn test_corrupt_context_rejected() {
        let mut session = AuthSession::new("s1", "portal", OffsetDateTime::UNIX_EPOCH);
        session.set_core_note(CoreNote::PostBrokerContext, "{not json");
        assert!(BrokeredIdentityContext::load(&session, BrokerStage::PostLogin).is_err());
    }

    #[test]
    fn test_link_from_context() {
        let ctx = BrokeredIdentityContext::new("github", "12345").with_username("octocat");
        let link = ctx.to_link("user-1", OffsetDateTime::UNIX_EPOCH);
        assert_eq!(link.external_id, "12345");
        assert_eq!(link.external_username.as_deref(), Some("octocat"));
        assert_eq!(link.user_id, "user-1");
    }
}
