//! Reserved auth session notes.
//!
//! Notes are an open string map shared with collaborators. Every key the
//! flow core relies on is listed in [`CoreNote`] and lives under the
//! `authflow.` prefix; the raw map is only touched here.

use serde::{Deserialize, Serialize};

use super::model::AuthSession;
use crate::AuthResult;
use crate::error::AuthError;

/// Prefix of every note key owned by the flow core.
pub const CORE_NOTE_PREFIX: &str = "authflow.";

/// User session note naming the provider the user logged in with.
pub const IDENTITY_PROVIDER_NOTE: &str = "identity_provider";

/// User session note with the username at the provider.
pub const IDENTITY_PROVIDER_USERNAME_NOTE: &str = "identity_provider_username";

/// Client note carrying the flow path the application started.
pub const APP_INITIATED_FLOW_NOTE: &str = "authflow.app_initiated_flow";

/// Client note carrying the `state` parameter of the protocol request.
pub const STATE_NOTE: &str = "state";

/// Flow path of plain logins.
pub const AUTHENTICATE_PATH: &str = "authenticate";

/// Flow path of the first broker login.
pub const FIRST_BROKER_LOGIN_PATH: &str = "first-broker-login";

/// Flow path of the post broker login.
pub const POST_BROKER_LOGIN_PATH: &str = "post-broker-login";

/// Auth notes reserved by the flow core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreNote {
    /// Serialized key of the last action token consumed in this session.
    LastActionToken,
    /// User id stamped by a verified action token.
    ActionTokenUser,
    /// Path of the flow currently running.
    CurrentFlowPath,
    /// Error message to display on the next flow execution.
    ForwardedError,
    /// Secret half of the current session code.
    SessionCode,
    /// Unix timestamp at which the session code was issued.
    SessionCodeIssuedAt,
    /// Pending client-initiated link.
    LinkingIntent,
    /// Brokered identity waiting for the first broker login flow.
    FirstBrokerContext,
    /// Brokered identity waiting for the post broker login flow.
    PostBrokerContext,
    /// Provider alias whose first broker login flow completed.
    FirstBrokerSuccess,
    /// Whether the post broker login flow follows a first broker login.
    PostBrokerAfterFirst,
    /// Set when the first broker login registered a new user.
    BrokerRegisteredNewUser,
    /// User id the first broker login decided to link to.
    ExistingUser,
    /// Set when the profile review changed the e-mail address.
    ProfileEmailChanged,
    /// Provider alias whose link was confirmed by e-mail.
    BrokerLinkVerified,
    /// Session id at the external provider.
    BrokerSessionId,
    /// User id at the external provider.
    BrokerUserId,
}

impl CoreNote {
    /// Returns the storage key.
    #[must_use]
    pub fn key(&self) -> &'static str {
        match self {
            Self::LastActionToken => "authflow.last_action_token",
            Self::ActionTokenUser => "authflow.action_token_user",
            Self::CurrentFlowPath => "authflow.current_flow_path",
            Self::ForwardedError => "authflow.forwarded_error",
            Self::SessionCode => "authflow.session_code",
            Self::SessionCodeIssuedAt => "authflow.session_code_issued_at",
            Self::LinkingIntent => "authflow.linking_intent",
            Self::FirstBrokerContext => "authflow.first_broker_login.context",
            Self::PostBrokerContext => "authflow.post_broker_login.context",
            Self::FirstBrokerSuccess => "authflow.first_broker_login.success",
            Self::PostBrokerAfterFirst => "authflow.post_broker_login.after_first",
            Self::BrokerRegisteredNewUser => "authflow.broker.registered_new_user",
            Self::ExistingUser => "authflow.broker.existing_user",
            Self::ProfileEmailChanged => "authflow.broker.profile_email_changed",
            Self::BrokerLinkVerified => "authflow.broker.link_verified",
            Self::BrokerSessionId => "authflow.broker.session_id",
            Self::BrokerUserId => "authflow.broker.user_id",
        }
    }
}

/// Key of the per-provider post broker login success marker.
fn post_broker_success_key(alias: &str) -> String {
    format!("authflow.post_broker_login.success.{alias}")
}

/// Authorization to turn the next broker login into a link for a logged-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkingIntent {
    /// Logged-in user session requesting the link.
    pub user_session_id: String,
    /// Application that initiated the link.
    pub client_id: String,
    /// Provider to link.
    pub provider_alias: String,
}

impl LinkingIntent {
    #[must_use]
    pub fn new(
        user_session_id: impl Into<String>,
        client_id: impl Into<String>,
        provider_alias: impl Into<String>,
    ) -> Self {
        Self {
            user_session_id: user_session_id.into(),
            client_id: client_id.into(),
            provider_alias: provider_alias.into(),
        }
    }
}

// ============================================================================
// Typed accessors
// ============================================================================

impl AuthSession {
    /// Reads a core note.
    #[must_use]
    pub fn core_note(&self, note: CoreNote) -> Option<&str> {
        self.note(note.key())
    }

    /// Writes a core note.
    pub fn set_core_note(&mut self, note: CoreNote, value: impl Into<String>) {
        self.set_note(note.key(), value);
    }

    /// Removes a core note, returning its previous value.
    pub fn remove_core_note(&mut self, note: CoreNote) -> Option<String> {
        self.remove_note(note.key())
    }

    /// Returns `true` if a boolean core note is set to `true`.
    #[must_use]
    pub fn core_flag(&self, note: CoreNote) -> bool {
        self.core_note(note).is_some_and(|v| v == "true")
    }

    /// Stores the pending linking intent.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Internal` if the intent cannot be serialized.
    pub fn set_linking_intent(&mut self, intent: &LinkingIntent) -> AuthResult<()> {
        let value = serde_json::to_string(intent)
            .map_err(|e| AuthError::internal(format!("failed to serialize linking intent: {e}")))?;
        self.set_core_note(CoreNote::LinkingIntent, value);
        Ok(())
    }

    /// Removes and returns the pending linking intent.
    ///
    /// The note is removed even when it does not parse, so a damaged intent
    /// cannot be retried.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::LinkingSessionExpired` if the note is not a valid intent.
    pub fn take_linking_intent(&mut self) -> AuthResult<Option<LinkingIntent>> {
        match self.remove_core_note(CoreNote::LinkingIntent) {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|_| AuthError::LinkingSessionExpired),
        }
    }

    /// Returns `true` if a linking intent is pending.
    #[must_use]
    pub fn has_linking_intent(&self) -> bool {
        self.core_note(CoreNote::LinkingIntent).is_some()
    }

    /// Marks the post broker login flow of `alias` as completed.
    pub fn set_post_broker_success(&mut self, alias: &str) {
        self.set_note(post_broker_success_key(alias), "true");
    }

    /// Returns `true` if the post broker login flow of `alias` completed.
    #[must_use]
    pub fn post_broker_success(&self, alias: &str) -> bool {
        self.note(&post_broker_success_key(alias)) == Some("true")
    }

    /// Clears the post broker login success marker of `alias`.
    pub fn remove_post_broker_success(&mut self, alias: &str) {
        self.remove_note(&post_broker_success_key(alias));
    }

    /// Takes the forwarded error message, if any.
    pub fn take_forwarded_error(&mut self) -> Option<String> {
        self.remove_core_note(CoreNote::ForwardedError)
    }
}
