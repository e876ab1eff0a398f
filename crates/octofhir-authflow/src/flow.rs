//! Flow executor contract.
//!
//! The individual login steps (forms, credentials, required actions) are run
//! by an external [`FlowExecutor`]. The flow core never looks inside a flow:
//! it only learns whether the flow needs more user input or has completed.
//! [`FlowProcessor`] wraps the executor with the bookkeeping the core owns:
//! forwarded error messages, broker success markers and session persistence.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::AuthResult;
use crate::broker::context::{BrokerStage, BrokeredIdentityContext};
use crate::clock::Clock;
use crate::error::AuthError;
use crate::outcome::{Outcome, Page};
use crate::realm::Realm;
use crate::session::{
    APP_INITIATED_FLOW_NOTE, AUTHENTICATE_PATH, AuthSession, AuthSessionStore, CoreNote,
    FIRST_BROKER_LOGIN_PATH, STATE_NOTE, issue_code,
};
use crate::store::{ClientSession, IdentityStore, User, UserSession, UserSessionStore};
use crate::urls::{Urls, with_query};

/// Flow path of user registration.
pub const REGISTRATION_PATH: &str = "registration";

/// Flow path of credential reset.
pub const RESET_CREDENTIALS_PATH: &str = "reset-credentials";

/// One execution request for a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRequest {
    /// Flow to run.
    pub flow_id: String,
    /// Path the flow was entered through.
    pub flow_path: String,
    /// `true` for form submissions, `false` for page loads.
    pub action_submission: bool,
    /// Execution the submission belongs to.
    pub execution: Option<String>,
    /// Error to display with the next challenge.
    pub error_message: Option<String>,
}

/// What a flow execution decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowDisposition {
    /// The flow needs user input; show this.
    Challenge(Outcome),
    /// The flow finished successfully.
    Completed,
}

/// Result of completing an authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Required actions remain. The auth session must be kept.
    Pending(Outcome),
    /// The user is logged in. The auth session is done.
    Finished(Outcome),
}

/// Runs authentication flows.
#[async_trait]
pub trait FlowExecutor: Send + Sync {
    /// Executes a flow against `session`.
    ///
    /// The executor may set the authenticated user and any notes of its own.
    ///
    /// # Errors
    ///
    /// Returns an error if the flow fails in a way that ends the attempt.
    async fn execute(
        &self,
        session: &mut AuthSession,
        request: &FlowRequest,
    ) -> AuthResult<FlowDisposition>;

    /// Continues after authentication: runs pending required actions or
    /// logs the user in and redirects back to the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the session has no usable authenticated user.
    async fn complete_authentication(&self, session: &mut AuthSession) -> AuthResult<Completion>;
}

// ============================================================================
// Processor
// ============================================================================

/// Drives a [`FlowExecutor`] and persists the session afterwards.
///
/// Every method takes the session by value: once it returns, the session has
/// either been written back or removed.
pub struct FlowProcessor {
    executor: Arc<dyn FlowExecutor>,
    sessions: Arc<dyn AuthSessionStore>,
    realm: Arc<Realm>,
    urls: Urls,
    clock: Arc<dyn Clock>,
}

impl FlowProcessor {
    #[must_use]
    pub fn new(
        executor: Arc<dyn FlowExecutor>,
        sessions: Arc<dyn AuthSessionStore>,
        realm: Arc<Realm>,
        urls: Urls,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            executor,
            sessions,
            realm,
            urls,
            clock,
        }
    }

    /// Returns the flow id run for `flow_path`.
    #[must_use]
    pub fn flow_for_path(&self, flow_path: &str) -> String {
        match flow_path {
            AUTHENTICATE_PATH => self.realm.browser_flow.clone(),
            REGISTRATION_PATH => "registration".to_string(),
            RESET_CREDENTIALS_PATH => "reset credentials".to_string(),
            other => other.to_string(),
        }
    }

    /// Runs the flow the session is currently on.
    ///
    /// # Errors
    ///
    /// Returns executor and storage errors.
    pub async fn authenticate(
        &self,
        mut session: AuthSession,
        error_message: Option<String>,
    ) -> AuthResult<Outcome> {
        let flow_path = session.flow_path().unwrap_or(AUTHENTICATE_PATH).to_string();
        let forwarded = session.take_forwarded_error();
        let request = FlowRequest {
            flow_id: self.flow_for_path(&flow_path),
            flow_path,
            action_submission: false,
            execution: None,
            error_message: error_message.or(forwarded),
        };

        match self.executor.execute(&mut session, &request).await? {
            FlowDisposition::Challenge(outcome) => {
                self.sessions.update(&session).await?;
                Ok(outcome)
            }
            FlowDisposition::Completed => self.complete_authentication(session).await,
        }
    }

    /// Resets the session to the flow the application started and runs it.
    ///
    /// # Errors
    ///
    /// Returns executor and storage errors.
    pub async fn restart(
        &self,
        mut session: AuthSession,
        error_message: Option<String>,
    ) -> AuthResult<Outcome> {
        let flow_path = session
            .client_note(APP_INITIATED_FLOW_NOTE)
            .unwrap_or(AUTHENTICATE_PATH)
            .to_string();
        tracing::debug!(session_id = %session.id, flow_path = %flow_path, "Restarting flow");
        session.reset_flow(&flow_path);
        self.authenticate(session, error_message).await
    }

    /// Continues after authentication and persists or removes the session.
    ///
    /// # Errors
    ///
    /// Returns executor and storage errors.
    pub async fn complete_authentication(&self, mut session: AuthSession) -> AuthResult<Outcome> {
        match self.executor.complete_authentication(&mut session).await? {
            Completion::Pending(outcome) => {
                self.sessions.update(&session).await?;
                Ok(outcome)
            }
            Completion::Finished(outcome) => {
                self.sessions.remove(&session.id).await?;
                Ok(outcome)
            }
        }
    }

    /// Runs a broker login flow.
    ///
    /// On completion the stage's success marker is set for `alias` and the
    /// browser is sent to the matching after-broker-login callback with a
    /// fresh session code.
    ///
    /// # Errors
    ///
    /// Returns executor and storage errors.
    pub async fn broker_flow(
        &self,
        mut session: AuthSession,
        stage: BrokerStage,
        alias: &str,
        flow_id: &str,
        action_submission: bool,
        execution: Option<String>,
    ) -> AuthResult<Outcome> {
        let request = FlowRequest {
            flow_id: flow_id.to_string(),
            flow_path: stage.flow_path().to_string(),
            action_submission,
            execution,
            error_message: session.take_forwarded_error(),
        };

        match self.executor.execute(&mut session, &request).await? {
            FlowDisposition::Challenge(outcome) => {
                self.sessions.update(&session).await?;
                Ok(outcome)
            }
            FlowDisposition::Completed => {
                match stage {
                    BrokerStage::FirstLogin => {
                        session.set_core_note(CoreNote::FirstBrokerSuccess, alias);
                    }
                    BrokerStage::PostLogin => session.set_post_broker_success(alias),
                }
                let code = issue_code(&mut session, self.clock.now());
                let url = match stage {
                    BrokerStage::FirstLogin => {
                        self.urls.after_first_broker_login(&code, &session.client_id)?
                    }
                    BrokerStage::PostLogin => {
                        self.urls.after_post_broker_login(&code, &session.client_id)?
                    }
                };
                self.sessions.update(&session).await?;
                tracing::debug!(
                    session_id = %session.id,
                    provider = %alias,
                    flow = %flow_id,
                    "Broker login flow completed"
                );
                Ok(Outcome::Redirect(url))
            }
        }
    }
}

// ============================================================================
// Immediate executor
// ============================================================================

/// Development executor without any interactive steps.
///
/// - A session with an authenticated user completes every flow.
/// - The first broker login registers the brokered identity as a new user
///   when its username and e-mail are free; otherwise it asks to confirm
///   linking to the existing account, which completes once the link was
///   verified by e-mail.
/// - Any other flow without an authenticated user challenges with a login form.
/// - Completion challenges the first pending required action, otherwise
///   opens a user session and redirects to the client.
pub struct ImmediateFlowExecutor {
    identities: Arc<dyn IdentityStore>,
    user_sessions: Arc<dyn UserSessionStore>,
    realm: Arc<Realm>,
    clock: Arc<dyn Clock>,
}

impl ImmediateFlowExecutor {
    #[must_use]
    pub fn new(
        identities: Arc<dyn IdentityStore>,
        user_sessions: Arc<dyn UserSessionStore>,
        realm: Arc<Realm>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            identities,
            user_sessions,
            realm,
            clock,
        }
    }

    async fn first_broker_login(&self, session: &mut AuthSession) -> AuthResult<FlowDisposition> {
        let context = BrokeredIdentityContext::load(session, BrokerStage::FirstLogin)?
            .ok_or_else(|| AuthError::invalid_request("no brokered identity in session"))?;
        let username = context.canonical_username(self.realm.registration_email_as_username);

        let mut existing = self.identities.find_user_by_username(&username).await?;
        if existing.is_none() {
            if let Some(email) = context.email.as_deref().filter(|e| !e.is_empty()) {
                existing = self.identities.find_user_by_email(email).await?;
            }
        }

        if let Some(existing) = existing {
            session.set_core_note(CoreNote::ExistingUser, existing.id.clone());
            if session.core_note(CoreNote::BrokerLinkVerified) == Some(context.provider_alias.as_str())
            {
                session.set_authenticated_user(&existing.id)?;
                return Ok(FlowDisposition::Completed);
            }
            return Ok(FlowDisposition::Challenge(
                Page::challenge("idp-link-confirm")
                    .with_attribute("username", existing.username)
                    .with_attribute("identity_provider", context.provider_alias)
                    .into(),
            ));
        }

        let mut user = User::new(username);
        user.email = context.email.clone();
        user.first_name = context.first_name.clone();
        user.last_name = context.last_name.clone();
        self.identities.add_user(&user).await?;

        session.set_core_note(CoreNote::BrokerRegisteredNewUser, "true");
        session.set_authenticated_user(&user.id)?;
        tracing::info!(
            user_id = %user.id,
            username = %user.username,
            provider = %context.provider_alias,
            "Registered user from brokered identity"
        );
        Ok(FlowDisposition::Completed)
    }
}

#[async_trait]
impl FlowExecutor for ImmediateFlowExecutor {
    async fn execute(
        &self,
        session: &mut AuthSession,
        request: &FlowRequest,
    ) -> AuthResult<FlowDisposition> {
        if session.authenticated_user().is_some() {
            return Ok(FlowDisposition::Completed);
        }
        if request.flow_path == FIRST_BROKER_LOGIN_PATH {
            return self.first_broker_login(session).await;
        }

        let mut page = Page::challenge("login-form");
        if let Some(message) = &request.error_message {
            page = page.with_message(message.clone());
        }
        Ok(FlowDisposition::Challenge(page.into()))
    }

    async fn complete_authentication(&self, session: &mut AuthSession) -> AuthResult<Completion> {
        let user_id = session
            .authenticated_user()
            .ok_or_else(|| AuthError::invalid_user("no authenticated user in session"))?
            .to_string();
        let user = self
            .identities
            .get_user(&user_id)
            .await?
            .ok_or_else(|| AuthError::invalid_user(format!("user {user_id} not found")))?;
        if !user.enabled {
            return Err(AuthError::AccountDisabled);
        }

        let pending: BTreeSet<&String> = session
            .required_actions
            .iter()
            .chain(user.required_actions.iter())
            .collect();
        if let Some(action) = pending.first() {
            return Ok(Completion::Pending(
                Page::challenge("required-action")
                    .with_attribute("action", action.as_str())
                    .into(),
            ));
        }

        let now = self.clock.now();
        let mut user_session = match self.user_sessions.get(&session.id).await? {
            Some(existing) if existing.user_id == user.id => existing,
            _ => UserSession::new(&session.id, &user.id, now),
        };
        let mut client_session = ClientSession::new(&session.client_id);
        client_session.roles = user.roles.clone();
        client_session.redirect_uri = session.redirect_uri.clone();
        user_session
            .client_sessions
            .insert(session.client_id.clone(), client_session);
        for (key, value) in session.user_session_notes() {
            user_session.notes.insert(key.clone(), value.clone());
        }
        self.user_sessions.create(&user_session).await?;

        let target = session
            .redirect_uri
            .as_deref()
            .and_then(|u| url::Url::parse(u).ok())
            .or_else(|| self.realm.client(&session.client_id).and_then(|c| c.base_url()))
            .unwrap_or_else(|| self.realm.public_url.clone());

        let mut params = vec![("session_state", session.id.as_str())];
        if let Some(state) = session.client_note(STATE_NOTE) {
            params.push(("state", state));
        }
        tracing::info!(
            user_id = %user.id,
            session_id = %session.id,
            client_id = %session.client_id,
            "User logged in"
        );
        Ok(Completion::Finished(Outcome::Redirect(with_query(target, &params))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::AuthFlowConfig;
    use crate::session::{InMemoryAuthSessionStore, SessionCode};
    use crate::store::{InMemoryIdentityStore, InMemoryUserSessionStore};

    struct Fixture {
        processor: FlowProcessor,
        sessions: Arc<InMemoryAuthSessionStore>,
        identities: Arc<InMemoryIdentityStore>,
        user_sessions: Arc<InMemoryUserSessionStore>,
        clock: Arc<FixedClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(FixedClock::starting_now());
        let realm = Arc::new(Realm::from_config(&AuthFlowConfig::default()).unwrap());
        let sessions = Arc::new(InMemoryAuthSessionStore::new(
            std::time::Duration::from_secs(1800),
            clock.clone(),
        ));
        let identities = Arc::new(InMemoryIdentityStore::new());
        let user_sessions = Arc::new(InMemoryUserSessionStore::new());
        let executor = Arc::new(ImmediateFlowExecutor::new(
            identities.clone(),
            user_sessions.clone(),
            realm.clone(),
            clock.clone(),
        ));
        let processor = FlowProcessor::new(
            executor,
            sessions.clone(),
            realm.clone(),
            Urls::new(&realm.public_url),
            clock.clone(),
        );
        Fixture {
            processor,
            sessions,
            identities,
            user_sessions,
            clock,
        }
    }

    #[tokio::test]
    async fn test_unauthenticated_flow_challenges_with_error() {
        let f = fixture();
        let session = AuthSession::new("s1", "portal", f.clock.now());
        f.sessions.create(&session).await.unwrap();

        let outcome = f
            .processor
            .restart(session, Some("Login timed out".to_string()))
            .await
            .unwrap();
        let page = outcome.page().unwrap();
        assert_eq!(page.form.as_deref(), Some("login-form"));
        assert_eq!(page.message.as_deref(), Some("Login timed out"));

        let stored = f.sessions.get("s1").await.unwrap().unwrap();
        assert_eq!(stored.flow_path(), Some(AUTHENTICATE_PATH));
    }

    #[tokio::test]
    async fn test_completion_creates_user_session_and_removes_auth_session() {
        let f = fixture();
        let user = User::new("alice");
        f.identities.add_user(&user).await.unwrap();

        let mut session = AuthSession::new("s1", "portal", f.clock.now());
        session.redirect_uri = Some("https://app.example.com/cb".to_string());
        session.set_client_note(STATE_NOTE, "xyz");
        session.set_authenticated_user(&user.id).unwrap();
        f.sessions.create(&session).await.unwrap();

        let outcome = f.processor.authenticate(session, None).await.unwrap();
        let url = outcome.redirect_url().unwrap();
        assert!(url.as_str().starts_with("https://app.example.com/cb?session_state=s1"));
        assert!(url.as_str().contains("state=xyz"));

        assert!(f.sessions.get("s1").await.unwrap().is_none());
        let user_session = f.user_sessions.get("s1").await.unwrap().unwrap();
        assert_eq!(user_session.user_id, user.id);
        assert!(user_session.client_session("portal").is_some());
    }

    #[tokio::test]
    async fn test_required_actions_keep_session() {
        let f = fixture();
        let user = User::new("alice");
        f.identities.add_user(&user).await.unwrap();

        let mut session = AuthSession::new("s1", "portal", f.clock.now());
        session.set_authenticated_user(&user.id).unwrap();
        session.required_actions.insert("UPDATE_PASSWORD".to_string());
        f.sessions.create(&session).await.unwrap();

        let outcome = f.processor.complete_authentication(session).await.unwrap();
        let page = outcome.page().unwrap();
        assert_eq!(page.attributes.get("action").map(String::as_str), Some("UPDATE_PASSWORD"));
        assert!(f.sessions.get("s1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_first_broker_flow_registers_user_and_sets_marker() {
        let f = fixture();
        let mut session = AuthSession::new("s1", "portal", f.clock.now());
        session.reset_flow(FIRST_BROKER_LOGIN_PATH);
        BrokeredIdentityContext::new("github", "gh-1")
            .with_username("octocat")
            .save(&mut session, BrokerStage::FirstLogin)
            .unwrap();
        f.sessions.create(&session).await.unwrap();

        let outcome = f
            .processor
            .broker_flow(
                session,
                BrokerStage::FirstLogin,
                "github",
                "first broker login",
                false,
                None,
            )
            .await
            .unwrap();
        let url = outcome.redirect_url().unwrap();
        assert_eq!(url.path(), "/broker/after-first-broker-login");

        let stored = f.sessions.get("s1").await.unwrap().unwrap();
        assert_eq!(stored.core_note(CoreNote::FirstBrokerSuccess), Some("github"));
        assert!(stored.core_flag(CoreNote::BrokerRegisteredNewUser));
        let user = f
            .identities
            .find_user_by_username("octocat")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.authenticated_user(), Some(user.id.as_str()));

        let code = url
            .query_pairs()
            .find(|(k, _)| k == "code")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        SessionCode::parse(&code)
            .unwrap()
            .verify(&stored, f.clock.now(), std::time::Duration::from_secs(300))
            .unwrap();
    }

    #[tokio::test]
    async fn test_first_broker_flow_asks_to_confirm_existing_account() {
        let f = fixture();
        f.identities.add_user(&User::new("octocat")).await.unwrap();

        let mut session = AuthSession::new("s1", "portal", f.clock.now());
        BrokeredIdentityContext::new("github", "gh-1")
            .with_username("octocat")
            .save(&mut session, BrokerStage::FirstLogin)
            .unwrap();
        session.set_core_note(CoreNote::CurrentFlowPath, FIRST_BROKER_LOGIN_PATH);
        f.sessions.create(&session).await.unwrap();

        let outcome = f
            .processor
            .broker_flow(
                session,
                BrokerStage::FirstLogin,
                "github",
                "first broker login",
                false,
                None,
            )
            .await
            .unwrap();
        assert_eq!(
            outcome.page().unwrap().form.as_deref(),
            Some("idp-link-confirm")
        );
        let stored = f.sessions.get("s1").await.unwrap().unwrap();
        assert!(stored.core_note(CoreNote::FirstBrokerSuccess).is_none());
        assert!(stored.core_note(CoreNote::ExistingUser).is_some());
    }
}
