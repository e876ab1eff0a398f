//! Action registry.
//!
//! An action token names the action it resumes. Each action id maps to an
//! [`ActionHandler`]: a plain struct describing the checks that apply, how a
//! fresh auth session is started for it, whether the token may be replayed
//! and the body that performs the action.
//!
//! - [`builtin`] - Handlers shipped with the flow core

pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::AuthResult;
use crate::error::AuthError;
use crate::events::{AuthEvent, EventType};
use crate::outcome::Outcome;
use crate::realm::ConnectionInfo;
use crate::services::AuthFlowServices;
use crate::session::{AUTHENTICATE_PATH, AuthSession};
use crate::store::User;
use crate::token::ActionToken;

pub use builtin::{
    EXECUTE_ACTIONS, IDP_VERIFY_ACCOUNT_VIA_EMAIL, VERIFY_EMAIL, execute_actions,
    idp_verify_account_via_email, verify_email,
};

/// Handler-specific token check, run once the session and user are known.
pub type TokenVerifier = fn(&ActionToken, &ActionContext<'_>) -> AuthResult<()>;

/// Creates the auth session used when the browser has no matching one.
pub type FreshSessionFactory = fn(&ActionToken, &AuthFlowServices) -> AuthResult<AuthSession>;

/// Everything a handler body sees.
pub struct ActionContext<'a> {
    pub services: &'a AuthFlowServices,
    /// Session the action runs in. Already stored.
    pub session: AuthSession,
    /// `true` if the session was created for this token.
    pub fresh_session: bool,
    /// Target user of the token, enabled.
    pub user: User,
    pub event: AuthEvent,
    /// Execution id passed with the request.
    pub execution: Option<String>,
    pub connection: ConnectionInfo,
}

/// Body of an action.
///
/// The body owns the session from here on: it must either store it or
/// remove it before returning.
#[async_trait]
pub trait ActionBody: Send + Sync {
    /// Performs the action.
    ///
    /// # Errors
    ///
    /// Returns an error if the action cannot be performed. The coordinator
    /// tears the session down for fatal errors.
    async fn handle(&self, token: &ActionToken, context: ActionContext<'_>) -> AuthResult<Outcome>;
}

/// Capability set of an action id.
#[derive(Clone)]
pub struct ActionHandler {
    pub action_id: &'static str,
    pub event_type: EventType,
    /// Event error code recorded for token failures.
    pub default_event_error: &'static str,
    /// Message shown for token failures.
    pub default_error_message: &'static str,
    /// Tokens of this action may be consumed more than once.
    pub can_use_repeatedly: bool,
    pub verifiers: Vec<TokenVerifier>,
    pub start_fresh_session: FreshSessionFactory,
    pub body: Arc<dyn ActionBody>,
}

impl ActionHandler {
    /// Creates a single-use handler with the default fresh session factory.
    #[must_use]
    pub fn new(action_id: &'static str, event_type: EventType, body: Arc<dyn ActionBody>) -> Self {
        Self {
            action_id,
            event_type,
            default_event_error: "invalid_code",
            default_error_message: "Invalid code.",
            can_use_repeatedly: false,
            verifiers: Vec::new(),
            start_fresh_session: default_fresh_session,
            body,
        }
    }

    #[must_use]
    pub fn with_default_error(mut self, event_error: &'static str, message: &'static str) -> Self {
        self.default_event_error = event_error;
        self.default_error_message = message;
        self
    }

    #[must_use]
    pub fn repeatable(mut self) -> Self {
        self.can_use_repeatedly = true;
        self
    }

    #[must_use]
    pub fn with_verifier(mut self, verifier: TokenVerifier) -> Self {
        self.verifiers.push(verifier);
        self
    }

    #[must_use]
    pub fn with_fresh_session(mut self, factory: FreshSessionFactory) -> Self {
        self.start_fresh_session = factory;
        self
    }

    /// Runs every verifier in registration order.
    ///
    /// # Errors
    ///
    /// Returns the first verifier failure.
    pub fn verify(&self, token: &ActionToken, context: &ActionContext<'_>) -> AuthResult<()> {
        self.verifiers
            .iter()
            .try_for_each(|verifier| verifier(token, context))
    }

    /// Message shown to the user for `error`.
    ///
    /// Token failures and rejected realm checks use the handler message so
    /// the response does not reveal which check failed.
    #[must_use]
    pub fn error_message(&self, error: &AuthError) -> String {
        match error {
            AuthError::BadSignature
            | AuthError::ActionMismatch { .. }
            | AuthError::AlreadyUsed
            | AuthError::InvalidCode { .. }
            | AuthError::RealmDisabled
            | AuthError::TlsRequired => self.default_error_message.to_string(),
            other => other.user_message(),
        }
    }

    /// Event error code recorded for `error`.
    #[must_use]
    pub fn event_error(&self, error: &AuthError) -> &'static str {
        match error {
            AuthError::BadSignature | AuthError::ActionMismatch { .. } => self.default_event_error,
            other => other.error_code(),
        }
    }
}

impl std::fmt::Debug for ActionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionHandler")
            .field("action_id", &self.action_id)
            .field("event_type", &self.event_type)
            .field("can_use_repeatedly", &self.can_use_repeatedly)
            .field("verifiers", &self.verifiers.len())
            .finish_non_exhaustive()
    }
}

/// Starts a session for the client the token was issued for, falling back
/// to the account console.
///
/// # Errors
///
/// Returns `AuthError::InvalidClient` if the client is unknown or disabled.
pub fn default_fresh_session(
    token: &ActionToken,
    services: &AuthFlowServices,
) -> AuthResult<AuthSession> {
    let realm = &services.realm;
    let client_id = token.azp.as_deref().unwrap_or(&realm.account_client_id);
    let client = realm.enabled_client(client_id)?;

    let mut session = AuthSession::generate(client_id, services.clock.now());
    session.protocol = client.protocol.clone();
    session.redirect_uri = match client.base_url() {
        Some(url) => Some(url.to_string()),
        None => Some(services.urls.account_console()?.to_string()),
    };
    session.reset_flow(AUTHENTICATE_PATH);
    Ok(session)
}

/// Action handlers by action id.
#[derive(Debug, Default, Clone)]
pub struct ActionRegistry {
    handlers: HashMap<&'static str, ActionHandler>,
}

impl ActionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in handlers.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(verify_email());
        registry.register(execute_actions());
        registry.register(idp_verify_account_via_email());
        registry
    }

    /// Registers `handler`, replacing any handler for the same action id.
    pub fn register(&mut self, handler: ActionHandler) {
        self.handlers.insert(handler.action_id, handler);
    }

    #[must_use]
    pub fn get(&self, action_id: &str) -> Option<&ActionHandler> {
        self.handlers.get(action_id)
    }

    /// Returns the handler for `action_id`.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::UnknownAction` if no handler is registered.
    pub fn resolve(&self, action_id: &str) -> AuthResult<&ActionHandler> {
        self.get(action_id)
            .ok_or_else(|| AuthError::unknown_action(action_id))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
