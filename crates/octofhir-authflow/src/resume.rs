//! Session resumption through action tokens.
//!
//! An action token arrives on a request that may or may not carry the
//! browser's auth session. The coordinator verifies the token, decides which
//! session the action runs in, enforces single use and hands over to the
//! handler body.
//!
//! Structural verification happens before any session is touched, so an
//! expired or tampered token gets a uniform answer. Handler checks run once
//! a session exists; any fatal failure from there on removes that session.

use crate::AuthResult;
use crate::actions::{ActionContext, ActionHandler};
use crate::error::AuthError;
use crate::events::{AuthEvent, EventType, details};
use crate::outcome::Outcome;
use crate::realm::ConnectionInfo;
use crate::services::AuthFlowServices;
use crate::session::{AuthSession, CoreNote};
use crate::store::User;
use crate::token::{ActionToken, TokenError};

/// An action token request.
#[derive(Debug, Clone, Default)]
pub struct ResumeRequest {
    /// The encoded token.
    pub token: String,
    /// Auth session id from the browser cookie.
    pub browser_session_id: Option<String>,
    /// Logged-in user session id from the identity cookie.
    pub user_session_id: Option<String>,
    /// Execution id of a form submission.
    pub execution: Option<String>,
    /// Client id passed along with the link.
    pub client_id: Option<String>,
    pub connection: ConnectionInfo,
}

/// Which session the action ran in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDisposition {
    /// The browser's session was the one the token was bound to.
    Reused,
    /// A new session was started for the token.
    Fresh,
    /// The token had expired; the browser's session was restarted instead.
    RestartedExpired,
}

/// Successful resumption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resumption {
    /// Session the browser should keep using. It may already be gone if the
    /// action finished the flow.
    pub session_id: String,
    pub disposition: SessionDisposition,
    pub outcome: Outcome,
}

/// Failed resumption with the message to show.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error}")]
pub struct ResumeError {
    pub error: AuthError,
    /// User-facing message.
    pub message: String,
}

impl ResumeError {
    fn new(error: AuthError, message: String) -> Self {
        Self { error, message }
    }
}

impl From<AuthError> for ResumeError {
    fn from(error: AuthError) -> Self {
        let message = error.user_message();
        Self { error, message }
    }
}

/// Resumes flows from action tokens.
pub struct SessionResumptionCoordinator<'a> {
    services: &'a AuthFlowServices,
}

impl<'a> SessionResumptionCoordinator<'a> {
    #[must_use]
    pub fn new(services: &'a AuthFlowServices) -> Self {
        Self { services }
    }

    /// Verifies `request.token` and runs its action.
    ///
    /// # Errors
    ///
    /// - `UnknownAction` / `BadSignature` / `ActionMismatch` for tokens that
    ///   do not verify
    /// - `Expired` when the token expired and the browser has no session
    /// - `RealmDisabled` / `TlsRequired` from the realm checks
    /// - `SessionHijackSuspected`, `InvalidUser`, `InvalidClient`,
    ///   `AlreadyUsed` and handler errors once a session was selected
    pub async fn resume(&self, request: ResumeRequest) -> Result<Resumption, ResumeError> {
        let services = self.services;
        let mut event = AuthEvent::new(EventType::ExecuteActionToken);
        event.realm(&services.realm.name);
        if let Some(client_id) = &request.client_id {
            event.client(client_id);
        }

        let (handler, bound_session) = match services
            .codec
            .peek(&request.token)
            .map_err(AuthError::from)
            .and_then(|peeked| {
                let handler = services.registry.resolve(peeked.action_id())?.clone();
                Ok((handler, peeked.asid))
            }) {
            Ok(resolved) => resolved,
            Err(error) => {
                event.error(error.error_code());
                return Err(error.into());
            }
        };
        let fail = |event: &AuthEvent, error: AuthError| {
            event.error(handler.event_error(&error));
            let message = handler.error_message(&error);
            ResumeError::new(error, message)
        };

        services
            .realm
            .check_request(&request.connection)
            .map_err(|e| fail(&event, e))?;

        // Unverified, only used to pick the lock.
        let lock_key = request.browser_session_id.clone().or(bound_session);
        let _lock = match &lock_key {
            Some(id) => Some(services.sessions.lock(id).await),
            None => None,
        };

        let browser_session = match &request.browser_session_id {
            Some(id) => services.sessions.get(id).await.map_err(|e| fail(&event, e))?,
            None => None,
        };

        let token = match services
            .codec
            .verify(&request.token, Some(handler.action_id))
        {
            Ok(token) => token,
            Err(TokenError::Expired) => {
                let Some(session) = browser_session else {
                    return Err(fail(&event, AuthError::Expired));
                };
                event.session(&session.id).error("expired_code");
                tracing::debug!(
                    session_id = %session.id,
                    action = %handler.action_id,
                    "Expired action token with browser session, restarting flow"
                );
                let session_id = session.id.clone();
                let outcome = services
                    .flows
                    .restart(session, Some(AuthError::Expired.user_message()))
                    .await?;
                return Ok(Resumption {
                    session_id,
                    disposition: SessionDisposition::RestartedExpired,
                    outcome,
                });
            }
            Err(other) => return Err(fail(&event, other.into())),
        };

        event
            .user(token.user_id())
            .detail(details::TOKEN_ID, token.jti.as_str())
            .detail(details::ACTION, token.action_id());

        let (session, disposition) = match browser_session {
            Some(session) if token.auth_session_id() == Some(session.id.as_str()) => {
                (session, SessionDisposition::Reused)
            }
            browser_session => {
                if let Some(asid) = token.auth_session_id() {
                    if let Err(error) = self
                        .check_not_logged_in_yet(asid, request.user_session_id.as_deref(), &token)
                        .await
                    {
                        if let Some(stale) = &browser_session {
                            self.discard(&stale.id).await;
                        }
                        return Err(fail(&event, error));
                    }
                }
                if let Some(stale) = browser_session {
                    tracing::debug!(
                        session_id = %stale.id,
                        token_id = %token.jti,
                        "Browser session does not match action token, starting fresh"
                    );
                    services
                        .sessions
                        .remove(&stale.id)
                        .await
                        .map_err(|e| fail(&event, e))?;
                }
                let session =
                    (handler.start_fresh_session)(&token, services).map_err(|e| fail(&event, e))?;
                services
                    .sessions
                    .create(&session)
                    .await
                    .map_err(|e| fail(&event, e))?;
                (session, SessionDisposition::Fresh)
            }
        };

        let session_id = session.id.clone();
        event
            .set_type(handler.event_type)
            .session(&session_id)
            .client(&session.client_id);

        let result = self
            .run_handler(
                &handler,
                &token,
                session,
                disposition == SessionDisposition::Fresh,
                event.clone(),
                request,
            )
            .await;

        match result {
            Ok(outcome) => Ok(Resumption {
                session_id,
                disposition,
                outcome,
            }),
            Err(error) => {
                if error.requires_session_teardown() {
                    self.discard(&session_id).await;
                }
                Err(fail(&event, error))
            }
        }
    }

    /// Removes an auth session on a fatal path, logging instead of failing.
    async fn discard(&self, session_id: &str) {
        if let Err(e) = self.services.sessions.remove(session_id).await {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to remove auth session");
        }
    }

    async fn run_handler(
        &self,
        handler: &ActionHandler,
        token: &ActionToken,
        session: AuthSession,
        fresh_session: bool,
        event: AuthEvent,
        request: ResumeRequest,
    ) -> AuthResult<Outcome> {
        let services = self.services;
        let user = self.valid_user(token).await?;
        let client_id = token.azp.as_deref().unwrap_or(&session.client_id);
        services.realm.enabled_client(client_id)?;

        let mut context = ActionContext {
            services,
            session,
            fresh_session,
            user,
            event,
            execution: request.execution,
            connection: request.connection,
        };
        handler.verify(token, &context)?;

        if !handler.can_use_repeatedly {
            let key = token.serialized_key();
            if context.session.core_note(CoreNote::LastActionToken) == Some(key.as_str()) {
                return Err(AuthError::AlreadyUsed);
            }
            if !services.consumed.mark_used(&key, token.exp).await? {
                return Err(AuthError::AlreadyUsed);
            }
            context.session.set_core_note(CoreNote::LastActionToken, key);
        }
        context
            .session
            .set_core_note(CoreNote::ActionTokenUser, token.user_id());
        services.sessions.update(&context.session).await?;

        handler.body.handle(token, context).await
    }

    async fn valid_user(&self, token: &ActionToken) -> AuthResult<User> {
        let user = self
            .services
            .identities
            .get_user(token.user_id())
            .await?
            .ok_or_else(|| AuthError::invalid_user("user not found"))?;
        if !user.enabled {
            return Err(AuthError::invalid_user("user disabled"));
        }
        if self.services.realm.brute_force_protected
            && self.services.brute_force.is_temporarily_disabled(&user).await
        {
            return Err(AuthError::invalid_user("user temporarily disabled"));
        }
        Ok(user)
    }

    /// Rejects a token bound to another session when a different user is
    /// already logged in there or in this browser.
    async fn check_not_logged_in_yet(
        &self,
        token_session_id: &str,
        browser_user_session_id: Option<&str>,
        token: &ActionToken,
    ) -> AuthResult<()> {
        for id in [Some(token_session_id), browser_user_session_id]
            .into_iter()
            .flatten()
        {
            if let Some(user_session) = self.services.user_sessions.get(id).await? {
                if user_session.user_id != token.user_id() {
                    tracing::warn!(
                        user_session_id = %id,
                        token_id = %token.jti,
                        "Action token targets a session of another logged-in user"
                    );
                    return Err(AuthError::SessionHijackSuspected);
                }
            }
        }
        Ok(())
    }
}
