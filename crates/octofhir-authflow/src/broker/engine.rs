//! Account linking decisions after a broker login.
//!
//! Once an external provider asserted an identity, the engine decides what
//! happens with it:
//!
//! 1. A pending linking intent links the identity to the logged-in user.
//! 2. An identity without a local user enters the first broker login flow.
//! 3. An identity with a local user enters the post broker login flow when
//!    the provider configures one, otherwise the login finishes.
//!
//! The sub-flows run through the [`FlowProcessor`](crate::flow::FlowProcessor)
//! and come back through the after-broker-login callbacks, which only proceed
//! when the flow left its success marker on the session.

use std::collections::HashMap;

use url::Url;

use super::context::{BrokerStage, BrokeredIdentityContext};
use super::provider::{BrokerCallback, IdentityProvider, LoginRequest};
use crate::AuthResult;
use crate::error::AuthError;
use crate::events::{AuthEvent, EventType, details};
use crate::outcome::Outcome;
use crate::services::AuthFlowServices;
use crate::session::{
    AUTHENTICATE_PATH, AuthSession, CoreNote, IDENTITY_PROVIDER_NOTE,
    IDENTITY_PROVIDER_USERNAME_NOTE, SessionCode, SessionLock, STATE_NOTE, issue_code,
};
use crate::store::{MANAGE_ACCOUNT_ROLE, READ_TOKEN_ROLE, User, UserSession};
use crate::urls::with_query;

/// Where a broker callback led.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    /// The identity was linked to the logged-in user.
    LinkExistingSession,
    /// The first broker login flow runs next.
    FirstLoginPending,
    /// The post broker login flow runs next.
    PostLoginFlowPending,
    /// Authentication finished.
    Finished,
}

/// A state transition and the response it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerStep {
    pub state: BrokerState,
    pub outcome: Outcome,
}

impl BrokerStep {
    fn new(state: BrokerState, outcome: Outcome) -> Self {
        Self { state, outcome }
    }
}

/// Message used when the user cancelled at the provider.
const CONSENT_DENIED: &str = "Consent denied.";

/// Broker login decision engine.
pub struct AccountLinkingEngine<'a> {
    services: &'a AuthFlowServices,
}

impl<'a> AccountLinkingEngine<'a> {
    #[must_use]
    pub fn new(services: &'a AuthFlowServices) -> Self {
        Self { services }
    }

    // ========================================================================
    // Entry points addressed by session code
    // ========================================================================

    /// Starts a login through `alias` for the session identified by `code`.
    ///
    /// # Errors
    ///
    /// - `InvalidCode` / `Expired` if the code does not verify
    /// - `IdentityProvider` if the provider is unknown, disabled, link-only
    ///   or has no implementation
    pub async fn start_login(&self, alias: &str, code: &str, client_id: &str) -> AuthResult<Outcome> {
        let (_lock, session) = self.session_from_code(code, Some(client_id)).await?;
        let session_id = session.id.clone();

        let result = async {
            let config = self.services.realm.enabled_identity_provider(alias)?;
            if config.link_only {
                return Err(AuthError::identity_provider(
                    alias,
                    "provider can only be used for account linking",
                ));
            }
            self.redirect_to_provider(session, alias).await
        }
        .await;
        self.teardown_on_error(&session_id, result).await
    }

    /// Handles the provider callback on the broker endpoint.
    ///
    /// The `state` parameter carries the session code issued for the login
    /// redirect; every other parameter is passed to the provider.
    ///
    /// # Errors
    ///
    /// Returns code, provider and linking errors.
    pub async fn handle_endpoint(
        &self,
        alias: &str,
        mut params: HashMap<String, String>,
    ) -> AuthResult<BrokerStep> {
        let state = params
            .remove("state")
            .ok_or_else(|| AuthError::identity_provider(alias, "missing state parameter"))?;
        let (_lock, session) = self.session_from_code(&state, None).await?;
        let session_id = session.id.clone();

        let result = async {
            let provider = self.provider(alias)?;
            match provider.handle_callback(&params).await? {
                BrokerCallback::Authenticated(context) => {
                    if context.provider_alias != alias {
                        return Err(AuthError::identity_provider(
                            alias,
                            "callback asserted an identity for another provider",
                        ));
                    }
                    self.on_broker_authenticated(session, context).await
                }
                BrokerCallback::Cancelled => Ok(BrokerStep::new(
                    BrokerState::Finished,
                    self.cancelled(session, alias).await?,
                )),
                BrokerCallback::Error(message) => Ok(BrokerStep::new(
                    BrokerState::Finished,
                    self.error(session, alias, &message).await?,
                )),
            }
        }
        .await;
        self.teardown_on_error(&session_id, result).await
    }

    /// Runs the first or post broker login flow for the session behind `code`.
    ///
    /// # Errors
    ///
    /// Returns code errors, `FlowNotConfigured` and flow errors.
    pub async fn resume_broker_flow(
        &self,
        stage: BrokerStage,
        code: &str,
        client_id: &str,
        action_submission: bool,
        execution: Option<String>,
    ) -> AuthResult<Outcome> {
        let (_lock, session) = self.session_from_code(code, Some(client_id)).await?;
        let session_id = session.id.clone();
        let result = self
            .broker_login_flow(session, stage, action_submission, execution)
            .await;
        self.teardown_on_error(&session_id, result).await
    }

    /// Continues after the first broker login flow reported success.
    ///
    /// # Errors
    ///
    /// Returns code errors, `InvalidRequest` when the flow did not finish,
    /// `AlreadyLinked` and flow errors.
    pub async fn after_first_broker_login(&self, code: &str, client_id: &str) -> AuthResult<Outcome> {
        let (_lock, session) = self.session_from_code(code, Some(client_id)).await?;
        let session_id = session.id.clone();
        let result = self.after_first_broker_login_session(session).await;
        self.teardown_on_error(&session_id, result).await
    }

    /// Continues after the post broker login flow reported success.
    ///
    /// # Errors
    ///
    /// Returns code errors, `InvalidRequest` when the flow did not finish,
    /// `DifferentUser` and flow errors.
    pub async fn after_post_broker_login(&self, code: &str, client_id: &str) -> AuthResult<Outcome> {
        let (_lock, session) = self.session_from_code(code, Some(client_id)).await?;
        let session_id = session.id.clone();
        let result = self.after_post_broker_login_session(session).await;
        self.teardown_on_error(&session_id, result).await
    }

    // ========================================================================
    // Decision engine
    // ========================================================================

    /// Decides what to do with an identity asserted by a provider.
    ///
    /// The caller holds the session lock.
    ///
    /// # Errors
    ///
    /// - `LinkingSessionExpired` if a linking intent does not match
    /// - `AlreadyLinked`, `NotAllowed`, `AccountDisabled` from linking
    /// - `AccountDisabled` for a disabled or locked federated user
    /// - `FlowNotConfigured` when the first broker login flow is missing
    pub async fn on_broker_authenticated(
        &self,
        mut session: AuthSession,
        mut context: BrokeredIdentityContext,
    ) -> AuthResult<BrokerStep> {
        let alias = context.provider_alias.clone();
        let config = self.services.realm.enabled_identity_provider(&alias)?.clone();
        if !config.store_token {
            context.token = None;
        }
        if let Some(provider) = self.services.providers.get(&alias) {
            provider.preprocess(&mut context).await?;
        }

        let mut event = self.event(EventType::IdentityProviderLogin, &session, &context);

        if session.has_linking_intent() {
            let intent = session.take_linking_intent()?;
            let user_session = match intent {
                Some(intent)
                    if intent.user_session_id == session.id
                        && intent.client_id == session.client_id
                        && intent.provider_alias == alias =>
                {
                    self.services.user_sessions.get(&intent.user_session_id).await?
                }
                _ => None,
            };
            let Some(user_session) = user_session else {
                tracing::warn!(
                    session_id = %session.id,
                    provider = %alias,
                    "Linking intent does not match broker callback"
                );
                event.error(AuthError::LinkingSessionExpired.error_code());
                return Err(AuthError::LinkingSessionExpired);
            };
            let outcome = self
                .perform_account_linking(session, user_session, context)
                .await?;
            return Ok(BrokerStep::new(BrokerState::LinkExistingSession, outcome));
        }

        let federated_user = self
            .services
            .identities
            .find_user_by_federated_identity(&alias, &context.id)
            .await?;

        let Some(mut user) = federated_user else {
            if config.link_only {
                return Err(AuthError::identity_provider(
                    &alias,
                    "no account is linked to this identity",
                ));
            }
            if config.first_broker_login_flow.is_none() {
                return Err(AuthError::flow_not_configured(&alias));
            }

            let username = context.canonical_username(self.services.realm.registration_email_as_username);
            context.model_username = Some(username.clone());
            context.save(&mut session, BrokerStage::FirstLogin)?;
            session.set_core_note(CoreNote::CurrentFlowPath, BrokerStage::FirstLogin.flow_path());

            let code = issue_code(&mut session, self.services.clock.now());
            let url = self
                .services
                .urls
                .first_broker_login(&code, &session.client_id)?;
            self.services.sessions.update(&session).await?;

            event
                .set_type(EventType::IdentityProviderFirstLogin)
                .detail(details::USERNAME, username)
                .success();
            tracing::debug!(
                session_id = %session.id,
                provider = %alias,
                "No local user for brokered identity, starting first broker login"
            );
            return Ok(BrokerStep::new(
                BrokerState::FirstLoginPending,
                Outcome::Redirect(url),
            ));
        };

        event.user(&user.id).detail(details::USERNAME, user.username.as_str());
        if let Err(e) = self.check_user_active(&user).await {
            event.error(e.error_code());
            return Err(e);
        }

        self.update_link_if_changed(&user, &context).await?;
        if let Some(provider) = self.services.providers.get(&alias) {
            let before = user.clone();
            provider.update_brokered_user(&mut user, &context).await?;
            if user != before {
                self.services.identities.update_user(&user).await?;
            }
        }
        session.set_authenticated_user(&user.id)?;

        if config.post_broker_login_flow.is_some() {
            let outcome = self
                .redirect_to_post_broker_login(session, &context, false)
                .await?;
            return Ok(BrokerStep::new(BrokerState::PostLoginFlowPending, outcome));
        }

        let outcome = self
            .after_post_broker_login_flow_success(session, context, false)
            .await?;
        Ok(BrokerStep::new(BrokerState::Finished, outcome))
    }

    /// Links the brokered identity to the user of `user_session`.
    ///
    /// Returns to the redirect URI captured when linking started. The auth
    /// session is removed.
    ///
    /// # Errors
    ///
    /// - `AlreadyLinked` if the identity belongs to another user
    /// - `NotAllowed` if the user may not manage the account
    /// - `AccountDisabled` if the user is disabled
    ///
    /// For the account console these are reported as a redirect instead.
    pub async fn perform_account_linking(
        &self,
        mut session: AuthSession,
        mut user_session: UserSession,
        context: BrokeredIdentityContext,
    ) -> AuthResult<Outcome> {
        let services = self.services;
        let alias = context.provider_alias.as_str();
        let mut event = self.event(EventType::FederatedIdentityLink, &session, &context);

        let user = services
            .identities
            .get_user(&user_session.user_id)
            .await?
            .ok_or_else(|| AuthError::invalid_user("user of the linking session not found"))?;
        event.user(&user.id).detail(details::USERNAME, user.username.as_str());
        session.set_authenticated_user(&user.id)?;

        let federated_user = services
            .identities
            .find_user_by_federated_identity(alias, &context.id)
            .await?;

        let rejection = if federated_user.as_ref().is_some_and(|u| u.id != user.id) {
            Some(AuthError::already_linked(alias))
        } else if !user.has_role(MANAGE_ACCOUNT_ROLE) {
            Some(AuthError::not_allowed("manage-account role required to link accounts"))
        } else if !user.enabled {
            Some(AuthError::AccountDisabled)
        } else {
            None
        };
        if let Some(error) = rejection {
            event.error(error.error_code());
            return self.linking_failed(session, Some(&user_session), error).await;
        }

        if federated_user.is_some() {
            self.update_link_if_changed(&user, &context).await?;
        } else {
            services
                .identities
                .add_federated_identity(&context.to_link(&user.id, services.clock.now()))
                .await?;
        }

        if let Some(provider) = services.providers.get(alias) {
            provider.authentication_finished(&mut session, &context).await?;
        }

        if user_session.note(IDENTITY_PROVIDER_NOTE).is_none() {
            user_session
                .notes
                .insert(IDENTITY_PROVIDER_NOTE.to_string(), alias.to_string());
            user_session.notes.insert(
                IDENTITY_PROVIDER_USERNAME_NOTE.to_string(),
                context.username.clone().unwrap_or_default(),
            );
            services.user_sessions.update(&user_session).await?;
        }

        let target = self.session_redirect(&session)?;
        services.sessions.remove(&session.id).await?;

        event.success();
        tracing::info!(
            user_id = %user.id,
            provider = %alias,
            "Linked federated identity to logged-in user"
        );
        Ok(Outcome::Redirect(target))
    }

    /// Runs the first or post broker login flow.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` if no brokered identity is parked for `stage`
    /// - `FlowNotConfigured` if the provider has no flow for `stage`
    pub async fn broker_login_flow(
        &self,
        mut session: AuthSession,
        stage: BrokerStage,
        action_submission: bool,
        execution: Option<String>,
    ) -> AuthResult<Outcome> {
        let context = BrokeredIdentityContext::load(&session, stage)?
            .ok_or_else(|| AuthError::invalid_request("no brokered identity in session"))?;
        let alias = context.provider_alias.as_str();
        let config = self.services.realm.enabled_identity_provider(alias)?;
        let flow_id = match stage {
            BrokerStage::FirstLogin => config.first_broker_login_flow.as_deref(),
            BrokerStage::PostLogin => config.post_broker_login_flow.as_deref(),
        }
        .ok_or_else(|| AuthError::flow_not_configured(alias))?;

        session.set_core_note(CoreNote::CurrentFlowPath, stage.flow_path());
        self.services
            .flows
            .broker_flow(session, stage, alias, flow_id, action_submission, execution)
            .await
    }

    async fn after_first_broker_login_session(&self, session: AuthSession) -> AuthResult<Outcome> {
        let (session, context) = self.link_first_broker_identity(session).await?;
        self.continue_after_first_broker_login(session, context).await
    }

    /// Links the identity of a finished first broker login to the user the
    /// flow authenticated or registered.
    async fn link_first_broker_identity(
        &self,
        session: AuthSession,
    ) -> AuthResult<(AuthSession, BrokeredIdentityContext)> {
        let services = self.services;
        let context = BrokeredIdentityContext::load(&session, BrokerStage::FirstLogin)?
            .ok_or_else(|| AuthError::invalid_request("no brokered identity in session"))?;
        let alias = context.provider_alias.clone();
        if session.core_note(CoreNote::FirstBrokerSuccess) != Some(alias.as_str()) {
            return Err(AuthError::invalid_request(
                "first broker login flow has not finished",
            ));
        }
        let config = services.realm.enabled_identity_provider(&alias)?.clone();
        let mut user = self.authenticated_user(&session).await?;
        let registered = session.core_flag(CoreNote::BrokerRegisteredNewUser);
        let mut event = self.event(EventType::FederatedIdentityLink, &session, &context);
        event.user(&user.id).detail(details::USERNAME, user.username.as_str());

        if registered && config.add_read_token_role_on_create {
            user.roles.insert(READ_TOKEN_ROLE.to_string());
        }

        let existing_link = services
            .identities
            .get_federated_identity(&user.id, &alias)
            .await?;
        match existing_link {
            Some(link) if link.external_id == context.id => {
                self.update_link_if_changed(&user, &context).await?;
            }
            Some(_) => {
                let error = AuthError::already_linked(&alias);
                event.error(error.error_code());
                return Err(error);
            }
            None => {
                if let Err(e) = services
                    .identities
                    .add_federated_identity(&context.to_link(&user.id, services.clock.now()))
                    .await
                {
                    event.error(e.error_code());
                    return Err(e);
                }
            }
        }

        let provider = services.providers.get(&alias);
        if registered {
            if let Some(provider) = &provider {
                provider.import_new_user(&mut user, &context).await?;
            }
            if config.trust_email
                && context.email.as_deref().is_some_and(|e| !e.is_empty())
                && !session.core_flag(CoreNote::ProfileEmailChanged)
            {
                user.email_verified = true;
            }
            event
                .set_type(EventType::Register)
                .detail(details::REGISTER_METHOD, "broker")
                .detail(details::EMAIL, user.email.clone().unwrap_or_default());
        } else if let Some(provider) = &provider {
            provider.update_brokered_user(&mut user, &context).await?;
        }
        services.identities.update_user(&user).await?;
        event.success();
        Ok((session, context))
    }

    async fn continue_after_first_broker_login(
        &self,
        session: AuthSession,
        context: BrokeredIdentityContext,
    ) -> AuthResult<Outcome> {
        let config = self
            .services
            .realm
            .enabled_identity_provider(&context.provider_alias)?;
        if config.post_broker_login_flow.is_some() {
            return self
                .redirect_to_post_broker_login(session, &context, true)
                .await;
        }
        self.finish_broker_authentication(session, context).await
    }

    async fn after_post_broker_login_session(&self, mut session: AuthSession) -> AuthResult<Outcome> {
        let context = BrokeredIdentityContext::load(&session, BrokerStage::PostLogin)?
            .ok_or_else(|| AuthError::invalid_request("no brokered identity in session"))?;
        let alias = context.provider_alias.clone();
        if !session.post_broker_success(&alias) {
            return Err(AuthError::invalid_request(
                "post broker login flow has not finished",
            ));
        }

        let was_first = session.core_flag(CoreNote::PostBrokerAfterFirst);
        BrokeredIdentityContext::remove(&mut session, BrokerStage::PostLogin);
        session.remove_core_note(CoreNote::PostBrokerAfterFirst);
        session.remove_post_broker_success(&alias);

        self.after_post_broker_login_flow_success(session, context, was_first)
            .await
    }

    /// Decides how to continue once every broker sub-flow is done.
    ///
    /// A first broker login still parked on the session means the user
    /// re-authenticated through another provider to prove ownership of the
    /// account being linked; that first login then resumes.
    async fn after_post_broker_login_flow_success(
        &self,
        mut session: AuthSession,
        context: BrokeredIdentityContext,
        was_first_broker_login: bool,
    ) -> AuthResult<Outcome> {
        if was_first_broker_login {
            return self.finish_broker_authentication(session, context).await;
        }

        let Some(first_login) = BrokeredIdentityContext::load(&session, BrokerStage::FirstLogin)?
        else {
            return self.finish_broker_authentication(session, context).await;
        };

        let user = self.authenticated_user(&session).await?;
        let linking_user_id = session
            .core_note(CoreNote::ExistingUser)
            .ok_or_else(|| AuthError::invalid_request("no user selected for linking"))?
            .to_string();
        if linking_user_id != user.id {
            let expected = self
                .services
                .identities
                .get_user(&linking_user_id)
                .await?
                .map_or(linking_user_id, |u| u.username);
            return Err(AuthError::different_user(&user.username, expected));
        }

        tracing::debug!(
            session_id = %session.id,
            provider = %context.provider_alias,
            linking_provider = %first_login.provider_alias,
            user_id = %user.id,
            "Re-authenticated through broker while linking another provider"
        );
        session.set_core_note(CoreNote::FirstBrokerSuccess, first_login.provider_alias);
        let (session, first_login) = self.link_first_broker_identity(session).await?;
        self.continue_after_first_broker_login(session, first_login).await
    }

    /// Records the broker login on the session and completes authentication.
    ///
    /// # Errors
    ///
    /// Returns provider hook and flow errors.
    pub async fn finish_broker_authentication(
        &self,
        mut session: AuthSession,
        context: BrokeredIdentityContext,
    ) -> AuthResult<Outcome> {
        let alias = context.provider_alias.as_str();
        session.set_user_session_note(IDENTITY_PROVIDER_NOTE, alias);
        session.set_user_session_note(
            IDENTITY_PROVIDER_USERNAME_NOTE,
            context.username.clone().unwrap_or_default(),
        );
        if let Some(id) = &context.broker_session_id {
            session.set_core_note(CoreNote::BrokerSessionId, id.as_str());
        }
        if let Some(id) = &context.broker_user_id {
            session.set_core_note(CoreNote::BrokerUserId, id.as_str());
        }

        if let Some(provider) = self.services.providers.get(alias) {
            provider.authentication_finished(&mut session, &context).await?;
        }
        BrokeredIdentityContext::remove(&mut session, BrokerStage::FirstLogin);
        BrokeredIdentityContext::remove(&mut session, BrokerStage::PostLogin);
        session.remove_core_note(CoreNote::FirstBrokerSuccess);

        let mut event = self.event(EventType::IdentityProviderLogin, &session, &context);
        if let Some(user_id) = session.authenticated_user() {
            event.user(user_id);
        }
        event.success();

        self.services.flows.complete_authentication(session).await
    }

    /// The user cancelled at the provider.
    ///
    /// # Errors
    ///
    /// Returns storage and flow errors.
    pub async fn cancelled(&self, session: AuthSession, alias: &str) -> AuthResult<Outcome> {
        tracing::debug!(session_id = %session.id, provider = %alias, "Broker login cancelled");
        self.broker_failure(session, CONSENT_DENIED).await
    }

    /// The provider reported an error.
    ///
    /// # Errors
    ///
    /// Returns storage and flow errors.
    pub async fn error(&self, session: AuthSession, alias: &str, message: &str) -> AuthResult<Outcome> {
        tracing::warn!(session_id = %session.id, provider = %alias, error = %message, "Broker login failed");
        self.broker_failure(session, message).await
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Redirects `session` to the provider's login page with a fresh code as
    /// the state.
    pub(crate) async fn redirect_to_provider(
        &self,
        mut session: AuthSession,
        alias: &str,
    ) -> AuthResult<Outcome> {
        let provider = self.provider(alias)?;
        let state = issue_code(&mut session, self.services.clock.now());
        let request = LoginRequest {
            session_id: session.id.clone(),
            state,
            redirect_uri: self.services.urls.broker_endpoint(alias)?,
            client_id: session.client_id.clone(),
        };
        self.services.sessions.update(&session).await?;
        let url = provider.login_redirect(&request).await?;
        tracing::debug!(session_id = %session.id, provider = %alias, "Redirecting to identity provider");
        Ok(Outcome::Redirect(url))
    }

    async fn redirect_to_post_broker_login(
        &self,
        mut session: AuthSession,
        context: &BrokeredIdentityContext,
        was_first_broker_login: bool,
    ) -> AuthResult<Outcome> {
        context.save(&mut session, BrokerStage::PostLogin)?;
        session.set_core_note(
            CoreNote::PostBrokerAfterFirst,
            was_first_broker_login.to_string(),
        );
        session.set_core_note(CoreNote::CurrentFlowPath, BrokerStage::PostLogin.flow_path());
        let code = issue_code(&mut session, self.services.clock.now());
        let url = self
            .services
            .urls
            .post_broker_login(&code, &session.client_id)?;
        self.services.sessions.update(&session).await?;
        Ok(Outcome::Redirect(url))
    }

    async fn broker_failure(&self, mut session: AuthSession, message: &str) -> AuthResult<Outcome> {
        let services = self.services;
        if services.realm.is_account_console(&session.client_id) {
            if let Some(user_session) = services.user_sessions.get(&session.id).await? {
                let mut event = AuthEvent::new(EventType::FederatedIdentityLink);
                event
                    .realm(&services.realm.name)
                    .session(&session.id)
                    .user(&user_session.user_id)
                    .error(message);
                services.sessions.remove(&session.id).await?;
                let url = with_query(services.urls.account_console()?, &[("error", message)]);
                return Ok(Outcome::Redirect(url));
            }
        }

        session.reset_flow(AUTHENTICATE_PATH);
        services
            .flows
            .authenticate(session, Some(message.to_string()))
            .await
    }

    /// Reports a rejected link. The account console gets a redirect with the
    /// error, everyone else the error itself.
    async fn linking_failed(
        &self,
        session: AuthSession,
        user_session: Option<&UserSession>,
        error: AuthError,
    ) -> AuthResult<Outcome> {
        let services = self.services;
        if services.realm.is_account_console(&session.client_id) && user_session.is_some() {
            services.sessions.remove(&session.id).await?;
            let url = with_query(
                services.urls.account_console()?,
                &[("error", error.error_code())],
            );
            return Ok(Outcome::Redirect(url));
        }
        Err(error)
    }

    async fn update_link_if_changed(
        &self,
        user: &User,
        context: &BrokeredIdentityContext,
    ) -> AuthResult<()> {
        let identities = &self.services.identities;
        let Some(mut link) = identities
            .get_federated_identity(&user.id, &context.provider_alias)
            .await?
        else {
            return Ok(());
        };

        let token_changed = context.token.is_some() && link.token != context.token;
        let username_changed =
            context.username.is_some() && link.external_username != context.username;
        if !token_changed && !username_changed {
            return Ok(());
        }
        if token_changed {
            link.token = context.token.clone();
        }
        if username_changed {
            link.external_username = context.username.clone();
        }
        identities.update_federated_identity(&link).await?;
        tracing::debug!(
            user_id = %user.id,
            provider = %context.provider_alias,
            "Refreshed federated identity link"
        );
        Ok(())
    }

    async fn check_user_active(&self, user: &User) -> AuthResult<()> {
        if !user.enabled {
            return Err(AuthError::AccountDisabled);
        }
        if self.services.realm.brute_force_protected
            && self.services.brute_force.is_temporarily_disabled(user).await
        {
            return Err(AuthError::AccountDisabled);
        }
        Ok(())
    }

    async fn authenticated_user(&self, session: &AuthSession) -> AuthResult<User> {
        let user_id = session
            .authenticated_user()
            .ok_or_else(|| AuthError::invalid_user("no authenticated user in session"))?;
        self.services
            .identities
            .get_user(user_id)
            .await?
            .ok_or_else(|| AuthError::invalid_user(format!("user {user_id} not found")))
    }

    fn provider(&self, alias: &str) -> AuthResult<std::sync::Arc<dyn IdentityProvider>> {
        self.services.realm.enabled_identity_provider(alias)?;
        self.services
            .providers
            .get(alias)
            .ok_or_else(|| AuthError::identity_provider(alias, "no implementation registered"))
    }

    fn session_redirect(&self, session: &AuthSession) -> AuthResult<Url> {
        if let Some(url) = session.redirect_uri.as_deref().and_then(|u| Url::parse(u).ok()) {
            return Ok(url);
        }
        match self
            .services
            .realm
            .client(&session.client_id)
            .and_then(|c| c.base_url())
        {
            Some(url) => Ok(url),
            None => self.services.urls.account_console(),
        }
    }

    fn event(
        &self,
        event_type: EventType,
        session: &AuthSession,
        context: &BrokeredIdentityContext,
    ) -> AuthEvent {
        let mut event = AuthEvent::new(event_type);
        event
            .realm(&self.services.realm.name)
            .client(&session.client_id)
            .session(&session.id)
            .detail(details::IDENTITY_PROVIDER, context.provider_alias.as_str())
            .detail(
                details::IDENTITY_PROVIDER_USERNAME,
                context.username.clone().unwrap_or_default(),
            );
        if let Some(state) = session.client_note(STATE_NOTE) {
            event.detail(details::CODE_ID, state);
        }
        event
    }

    async fn session_from_code(
        &self,
        code: &str,
        client_id: Option<&str>,
    ) -> AuthResult<(SessionLock, AuthSession)> {
        let parsed = SessionCode::parse(code)?;
        let lock = self.services.sessions.lock(parsed.session_id).await;
        let session = self
            .services
            .sessions
            .get(parsed.session_id)
            .await?
            .ok_or_else(|| AuthError::invalid_code("auth session not found"))?;
        parsed.verify(
            &session,
            self.services.clock.now(),
            self.services.config.sessions.code_lifespan,
        )?;
        if client_id.is_some_and(|c| c != session.client_id) {
            return Err(AuthError::invalid_code("session code issued for another client"));
        }
        Ok((lock, session))
    }

    async fn teardown_on_error<T>(&self, session_id: &str, result: AuthResult<T>) -> AuthResult<T> {
        if let Err(error) = &result {
            if error.requires_session_teardown() {
                if let Err(e) = self.services.sessions.remove(session_id).await {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to remove auth session");
                }
            }
        }
        result
    }
}
