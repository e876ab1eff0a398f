//! Security event trail.
//!
//! Every resumption, broker login and linking attempt produces one
//! [`AuthEvent`]. Events are emitted as `tracing` events on the
//! `authflow::events` target so they can be routed to a dedicated sink by the
//! subscriber configuration.

use std::collections::BTreeMap;
use std::fmt;

/// Tracing target used for security events.
pub const EVENT_TARGET: &str = "authflow::events";

/// Kinds of security events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Generic action token execution.
    ExecuteActionToken,
    /// E-mail verification through an action token.
    VerifyEmail,
    /// Required actions triggered by an administrator e-mail.
    ExecuteActions,
    /// Broker link confirmed through an e-mailed token.
    IdentityProviderLinkAccount,
    /// Login through an external identity provider.
    IdentityProviderLogin,
    /// First login of an external identity.
    IdentityProviderFirstLogin,
    /// Post broker login flow.
    IdentityProviderPostLogin,
    /// A federated identity was linked to a local user.
    FederatedIdentityLink,
    /// A user was registered through a broker login.
    Register,
    /// Browser login (including restarts).
    Login,
    /// An application asked to link an identity provider.
    ClientInitiatedAccountLinking,
}

impl EventType {
    /// Returns the wire name of the event type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecuteActionToken => "EXECUTE_ACTION_TOKEN",
            Self::VerifyEmail => "VERIFY_EMAIL",
            Self::ExecuteActions => "EXECUTE_ACTIONS",
            Self::IdentityProviderLinkAccount => "IDENTITY_PROVIDER_LINK_ACCOUNT",
            Self::IdentityProviderLogin => "IDENTITY_PROVIDER_LOGIN",
            Self::IdentityProviderFirstLogin => "IDENTITY_PROVIDER_FIRST_LOGIN",
            Self::IdentityProviderPostLogin => "IDENTITY_PROVIDER_POST_LOGIN",
            Self::FederatedIdentityLink => "FEDERATED_IDENTITY_LINK",
            Self::Register => "REGISTER",
            Self::Login => "LOGIN",
            Self::ClientInitiatedAccountLinking => "CLIENT_INITIATED_ACCOUNT_LINKING",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detail keys shared by several operations.
pub mod details {
    pub const USERNAME: &str = "username";
    pub const EMAIL: &str = "email";
    pub const TOKEN_ID: &str = "token_id";
    pub const ACTION: &str = "action";
    pub const REDIRECT_URI: &str = "redirect_uri";
    pub const IDENTITY_PROVIDER: &str = "identity_provider";
    pub const IDENTITY_PROVIDER_USERNAME: &str = "identity_provider_username";
    pub const REGISTER_METHOD: &str = "register_method";
    pub const CODE_ID: &str = "code_id";
}

/// Outcome recorded for an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// The operation succeeded.
    Success,
    /// The operation failed with the given error code.
    Error(String),
}

/// A security event under construction.
///
/// Builders accumulate context while the operation runs; [`AuthEvent::success`]
/// or [`AuthEvent::error`] emits it.
#[derive(Debug, Clone)]
pub struct AuthEvent {
    event_type: EventType,
    realm: Option<String>,
    client_id: Option<String>,
    user_id: Option<String>,
    session_id: Option<String>,
    details: BTreeMap<String, String>,
}

impl AuthEvent {
    /// Starts a new event.
    #[must_use]
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            realm: None,
            client_id: None,
            user_id: None,
            session_id: None,
            details: BTreeMap::new(),
        }
    }

    /// Changes the event type, keeping collected context.
    pub fn set_type(&mut self, event_type: EventType) -> &mut Self {
        self.event_type = event_type;
        self
    }

    pub fn realm(&mut self, realm: impl Into<String>) -> &mut Self {
        self.realm = Some(realm.into());
        self
    }

    pub fn client(&mut self, client_id: impl Into<String>) -> &mut Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn user(&mut self, user_id: impl Into<String>) -> &mut Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn session(&mut self, session_id: impl Into<String>) -> &mut Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Adds a detail. Empty values are ignored.
    pub fn detail(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        let value = value.into();
        if !value.is_empty() {
            self.details.insert(key.to_string(), value);
        }
        self
    }

    /// Removes a previously recorded detail.
    pub fn remove_detail(&mut self, key: &str) -> &mut Self {
        self.details.remove(key);
        self
    }

    #[must_use]
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    #[must_use]
    pub fn get_detail(&self, key: &str) -> Option<&str> {
        self.details.get(key).map(String::as_str)
    }

    /// Emits the event as successful.
    pub fn success(&self) {
        self.emit(&EventOutcome::Success);
    }

    /// Emits the event as failed with `error_code`.
    pub fn error(&self, error_code: &str) {
        self.emit(&EventOutcome::Error(error_code.to_string()));
    }

    fn emit(&self, outcome: &EventOutcome) {
        let client_id = self.client_id.as_deref().unwrap_or("-");
        let user_id = self.user_id.as_deref().unwrap_or("-");
        let session_id = self.session_id.as_deref().unwrap_or("-");
        let realm = self.realm.as_deref().unwrap_or("-");

        match outcome {
            EventOutcome::Success => tracing::info!(
                target: EVENT_TARGET,
                event = %self.event_type,
                realm,
                client_id,
                user_id,
                session_id,
                details = ?self.details,
                "auth event"
            ),
            EventOutcome::Error(code) => tracing::warn!(
                target: EVENT_TARGET,
                event = %self.event_type,
                realm,
                client_id,
                user_id,
                session_id,
                error = %code,
                details = ?self.details,
                "auth event failed"
            ),
        }
    }
}
