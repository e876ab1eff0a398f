//! Authentication flow error types.
//!
//! Every operation of the login-actions and broker layers returns
//! [`AuthResult`](crate::AuthResult). The HTTP layer decides how each variant
//! is rendered; this module only classifies them.

use std::fmt;

/// Errors raised while resuming, brokering or linking an authentication flow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The token signature or structure could not be verified.
    #[error("Invalid token signature")]
    BadSignature,

    /// The token or session code is past its expiry.
    #[error("Token expired")]
    Expired,

    /// The token was issued for a different action than the one requested.
    #[error("Action mismatch: expected {expected}, got {actual}")]
    ActionMismatch {
        /// Action id the caller expected.
        expected: String,
        /// Action id embedded in the token.
        actual: String,
    },

    /// A single-use token was presented a second time.
    #[error("Token already used")]
    AlreadyUsed,

    /// No handler is registered for the token's action id.
    #[error("Unknown action: {action}")]
    UnknownAction {
        /// The unresolved action id.
        action: String,
    },

    /// The realm is disabled.
    #[error("Realm is disabled")]
    RealmDisabled,

    /// The request arrived over plain HTTP but the realm requires TLS.
    #[error("HTTPS required")]
    TlsRequired,

    /// The user referenced by a token or session is missing or unusable.
    #[error("Invalid user: {message}")]
    InvalidUser {
        /// Description of why the user is invalid.
        message: String,
    },

    /// The client referenced by a token or request is missing or disabled.
    #[error("Invalid client: {message}")]
    InvalidClient {
        /// Description of why the client is invalid.
        message: String,
    },

    /// The token targets a session that already belongs to another logged-in user.
    #[error("Session already in use by another user")]
    SessionHijackSuspected,

    /// A linking intent was present but did not match the callback.
    #[error("Linking session expired")]
    LinkingSessionExpired,

    /// The external identity is already linked to a different local user.
    #[error("Identity from provider {provider} is already linked to another user")]
    AlreadyLinked {
        /// Alias of the identity provider.
        provider: String,
    },

    /// The caller lacks the permission required for the operation.
    #[error("Not allowed: {message}")]
    NotAllowed {
        /// Description of the missing permission.
        message: String,
    },

    /// The client-initiated linking digest did not verify.
    #[error("Invalid link handshake: {message}")]
    InvalidHandshake {
        /// Description of the handshake failure.
        message: String,
    },

    /// The request is malformed or missing parameters.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Description of why the request is invalid.
        message: String,
    },

    /// A session code or handler-specific token check failed.
    #[error("Invalid code: {message}")]
    InvalidCode {
        /// Description of the failed check.
        message: String,
    },

    /// The user account is disabled or temporarily locked.
    #[error("Account disabled")]
    AccountDisabled,

    /// Re-authentication resolved to a different user than the one being linked.
    #[error("Authenticated as {authenticated} but linking user {expected}")]
    DifferentUser {
        /// Username resolved from the broker callback.
        authenticated: String,
        /// Username selected earlier in the flow.
        expected: String,
    },

    /// The provider has no flow configured for the requested broker stage.
    #[error("Flow not configured for identity provider {provider}")]
    FlowNotConfigured {
        /// Alias of the identity provider.
        provider: String,
    },

    /// The identity provider is unknown, disabled or returned an error.
    #[error("Identity provider error: {provider} - {message}")]
    IdentityProvider {
        /// Alias of the identity provider.
        provider: String,
        /// Description of the error.
        message: String,
    },

    /// An error occurred while storing or retrieving flow state.
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the storage error.
        message: String,
    },

    /// The flow configuration is invalid.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration error.
        message: String,
    },

    /// An unexpected internal error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl AuthError {
    /// Creates a new `ActionMismatch` error.
    #[must_use]
    pub fn action_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::ActionMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates a new `UnknownAction` error.
    #[must_use]
    pub fn unknown_action(action: impl Into<String>) -> Self {
        Self::UnknownAction {
            action: action.into(),
        }
    }

    /// Creates a new `InvalidUser` error.
    #[must_use]
    pub fn invalid_user(message: impl Into<String>) -> Self {
        Self::InvalidUser {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidClient` error.
    #[must_use]
    pub fn invalid_client(message: impl Into<String>) -> Self {
        Self::InvalidClient {
            message: message.into(),
        }
    }

    /// Creates a new `AlreadyLinked` error.
    #[must_use]
    pub fn already_linked(provider: impl Into<String>) -> Self {
        Self::AlreadyLinked {
            provider: provider.into(),
        }
    }

    /// Creates a new `NotAllowed` error.
    #[must_use]
    pub fn not_allowed(message: impl Into<String>) -> Self {
        Self::NotAllowed {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidHandshake` error.
    #[must_use]
    pub fn invalid_handshake(message: impl Into<String>) -> Self {
        Self::InvalidHandshake {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidRequest` error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidCode` error.
    #[must_use]
    pub fn invalid_code(message: impl Into<String>) -> Self {
        Self::InvalidCode {
            message: message.into(),
        }
    }

    /// Creates a new `DifferentUser` error.
    #[must_use]
    pub fn different_user(authenticated: impl Into<String>, expected: impl Into<String>) -> Self {
        Self::DifferentUser {
            authenticated: authenticated.into(),
            expected: expected.into(),
        }
    }

    /// Creates a new `FlowNotConfigured` error.
    #[must_use]
    pub fn flow_not_configured(provider: impl Into<String>) -> Self {
        Self::FlowNotConfigured {
            provider: provider.into(),
        }
    }

    /// Creates a new `IdentityProvider` error.
    #[must_use]
    pub fn identity_provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::IdentityProvider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Creates a new `Storage` error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` only for failures the user can recover from by restarting the flow.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Expired)
    }

    /// Returns `true` if the failure must destroy the auth session it occurred in.
    ///
    /// Every failure but a recoverable one qualifies, storage failures
    /// included: a half-built session is never left behind.
    #[must_use]
    pub fn requires_session_teardown(&self) -> bool {
        !self.is_recoverable()
    }

    /// Returns `true` if the failure should be reported back to the calling
    /// application instead of rendering an error page.
    #[must_use]
    pub fn redirects_to_client(&self) -> bool {
        matches!(self, Self::NotAllowed { .. } | Self::InvalidHandshake { .. })
    }

    /// Returns `true` if this is a client error (4xx category).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        !self.is_server_error()
    }

    /// Returns `true` if this is a server error (5xx category).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            Self::Storage { .. }
                | Self::Configuration { .. }
                | Self::Internal { .. }
                | Self::FlowNotConfigured { .. }
        )
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::BadSignature
            | Self::Expired
            | Self::ActionMismatch { .. }
            | Self::AlreadyUsed
            | Self::UnknownAction { .. }
            | Self::InvalidCode { .. } => ErrorCategory::Token,
            Self::RealmDisabled | Self::TlsRequired | Self::InvalidRequest { .. } => {
                ErrorCategory::Validation
            }
            Self::InvalidUser { .. }
            | Self::InvalidClient { .. }
            | Self::AccountDisabled
            | Self::SessionHijackSuspected => ErrorCategory::Authentication,
            Self::NotAllowed { .. } => ErrorCategory::Authorization,
            Self::LinkingSessionExpired
            | Self::AlreadyLinked { .. }
            | Self::InvalidHandshake { .. }
            | Self::DifferentUser { .. } => ErrorCategory::Linking,
            Self::FlowNotConfigured { .. } | Self::IdentityProvider { .. } => {
                ErrorCategory::Federation
            }
            Self::Storage { .. } => ErrorCategory::Infrastructure,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Returns the machine-readable error code recorded in events and responses.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BadSignature | Self::ActionMismatch { .. } | Self::UnknownAction { .. } => {
                "invalid_code"
            }
            Self::Expired => "expired_code",
            Self::AlreadyUsed | Self::InvalidCode { .. } => "invalid_code",
            Self::RealmDisabled => "realm_disabled",
            Self::TlsRequired => "ssl_required",
            Self::InvalidUser { .. } => "user_not_found",
            Self::InvalidClient { .. } => "client_not_found",
            Self::SessionHijackSuspected => "different_user_authenticated",
            Self::LinkingSessionExpired => "linking_session_expired",
            Self::AlreadyLinked { .. } => "federated_identity_exists",
            Self::NotAllowed { .. } => "not_allowed",
            Self::InvalidHandshake { .. } => "invalid_token",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::AccountDisabled => "user_disabled",
            Self::DifferentUser { .. } => "different_user_authenticated",
            Self::FlowNotConfigured { .. } | Self::IdentityProvider { .. } => {
                "identity_provider_error"
            }
            Self::Storage { .. } | Self::Configuration { .. } | Self::Internal { .. } => {
                "server_error"
            }
        }
    }

    /// Returns the message that may be shown to the end user.
    ///
    /// Structural and cryptographic token failures share one message so the
    /// response never reveals which check failed.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::BadSignature
            | Self::ActionMismatch { .. }
            | Self::UnknownAction { .. }
            | Self::AlreadyUsed
            | Self::InvalidCode { .. } => "Invalid code.".to_string(),
            Self::Expired => "Your login attempt timed out. Login will start from the beginning."
                .to_string(),
            Self::RealmDisabled => "Realm not enabled.".to_string(),
            Self::TlsRequired => "HTTPS required.".to_string(),
            Self::InvalidUser { .. } => "Invalid user.".to_string(),
            Self::InvalidClient { .. } => "Unknown or disabled client.".to_string(),
            Self::SessionHijackSuspected => {
                "You are already authenticated as a different user in this session.".to_string()
            }
            Self::LinkingSessionExpired => {
                "Requested broker account linking, but current session is no longer valid."
                    .to_string()
            }
            Self::AlreadyLinked { provider } => format!(
                "Federated identity returned by {provider} is already linked to another user."
            ),
            Self::NotAllowed { .. } => "You don't have access to the requested action.".to_string(),
            Self::InvalidHandshake { .. } | Self::InvalidRequest { .. } => {
                "Invalid request.".to_string()
            }
            Self::AccountDisabled => "Account is disabled, contact your administrator.".to_string(),
            Self::DifferentUser {
                authenticated,
                expected,
            } => format!(
                "You are authenticated as {authenticated}, but you are supposed to be authenticated as {expected}."
            ),
            Self::FlowNotConfigured { .. } | Self::IdentityProvider { .. } => {
                "Unexpected error when authenticating with identity provider.".to_string()
            }
            Self::Storage { .. } | Self::Configuration { .. } | Self::Internal { .. } => {
                "Unexpected error when handling the request.".to_string()
            }
        }
    }
}

/// Categories of flow errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Token and session code verification.
    Token,
    /// Request validation.
    Validation,
    /// Identity verification of users and clients.
    Authentication,
    /// Permission checks.
    Authorization,
    /// Account linking decisions.
    Linking,
    /// Identity provider federation.
    Federation,
    /// Infrastructure/storage errors.
    Infrastructure,
    /// Configuration errors.
    Configuration,
    /// Internal server errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token => write!(f, "token"),
            Self::Validation => write!(f, "validation"),
            Self::Authentication => write!(f, "authentication"),
            Self::Authorization => write!(f, "authorization"),
            Self::Linking => write!(f, "linking"),
            Self::Federation => write!(f, "federation"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(AuthError::Expired.to_string(), "Token expired");
        assert_eq!(
            AuthError::action_mismatch("verify-email", "execute-actions").to_string(),
            "Action mismatch: expected verify-email, got execute-actions"
        );
        assert_eq!(
            AuthError::identity_provider("github", "connection failed").to_string(),
            "Identity provider error: github - connection failed"
        );
    }

    #[test]
    fn test_only_expired_is_recoverable() {
        assert!(AuthError::Expired.is_recoverable());
        assert!(!AuthError::BadSignature.is_recoverable());
        assert!(!AuthError::AlreadyUsed.is_recoverable());
        assert!(!AuthError::already_linked("github").is_recoverable());
    }

    #[test]
    fn test_fatal_errors_tear_down_session() {
        assert!(AuthError::AlreadyUsed.requires_session_teardown());
        assert!(AuthError::already_linked("github").requires_session_teardown());
        assert!(AuthError::SessionHijackSuspected.requires_session_teardown());
        assert!(AuthError::storage("down").requires_session_teardown());
        assert!(AuthError::internal("bug").requires_session_teardown());
        assert!(!AuthError::Expired.requires_session_teardown());
    }

    #[test]
    fn test_structural_failures_share_user_message() {
        let messages = [
            AuthError::BadSignature.user_message(),
            AuthError::action_mismatch("a", "b").user_message(),
            AuthError::unknown_action("x").user_message(),
            AuthError::AlreadyUsed.user_message(),
        ];
        assert!(messages.iter().all(|m| m == "Invalid code."));
        assert_ne!(AuthError::Expired.user_message(), "Invalid code.");
    }

    #[test]
    fn test_error_predicates() {
        assert!(AuthError::invalid_request("x").is_client_error());
        assert!(AuthError::storage("x").is_server_error());
        assert!(AuthError::not_allowed("x").redirects_to_client());
        assert!(AuthError::invalid_handshake("x").redirects_to_client());
        assert!(!AuthError::AlreadyUsed.redirects_to_client());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(AuthError::BadSignature.category(), ErrorCategory::Token);
        assert_eq!(AuthError::TlsRequired.category(), ErrorCategory::Validation);
        assert_eq!(
            AuthError::LinkingSessionExpired.category(),
            ErrorCategory::Linking
        );
        assert_eq!(
            AuthError::not_allowed("x").category(),
            ErrorCategory::Authorization
        );
        assert_eq!(
            AuthError::storage("x").category(),
            ErrorCategory::Infrastructure
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(AuthError::Expired.error_code(), "expired_code");
        assert_eq!(AuthError::AlreadyUsed.error_code(), "invalid_code");
        assert_eq!(AuthError::RealmDisabled.error_code(), "realm_disabled");
        assert_eq!(
            AuthError::already_linked("p").error_code(),
            "federated_identity_exists"
        );
    }

    #[test]
    fn test_error_category_display() {
        assert_eq!(ErrorCategory::Token.to_string(), "token");
        assert_eq!(ErrorCategory::Linking.to_string(), "linking");
        assert_eq!(ErrorCategory::Federation.to_string(), "federation");
    }
}
