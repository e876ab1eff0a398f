//! Built-in action handlers.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ActionBody, ActionContext, ActionHandler, default_fresh_session};
use crate::AuthResult;
use crate::broker::{AccountLinkingEngine, BrokerStage, BrokeredIdentityContext};
use crate::error::AuthError;
use crate::events::{EventType, details};
use crate::outcome::{Outcome, Page};
use crate::services::AuthFlowServices;
use crate::session::{AuthSession, CoreNote};
use crate::store::VERIFY_EMAIL_ACTION;
use crate::token::ActionToken;

pub const VERIFY_EMAIL: &str = "verify-email";
pub const EXECUTE_ACTIONS: &str = "execute-actions";
pub const IDP_VERIFY_ACCOUNT_VIA_EMAIL: &str = "idp-verify-account-via-email";

/// Token note: e-mail address being verified.
pub const EMAIL_NOTE: &str = "eml";
/// Token note: comma separated required actions.
pub const REQUIRED_ACTIONS_NOTE: &str = "rqac";
/// Token note: redirect URI after the actions.
pub const REDIRECT_URI_NOTE: &str = "reduri";
/// Token note: alias of the provider being linked.
pub const IDP_ALIAS_NOTE: &str = "idpa";
/// Token note: username at the provider being linked.
pub const IDP_USERNAME_NOTE: &str = "idpu";

// ============================================================================
// verify-email
// ============================================================================

/// Confirms the e-mail address of the token's user.
#[must_use]
pub fn verify_email() -> ActionHandler {
    ActionHandler::new(VERIFY_EMAIL, EventType::VerifyEmail, Arc::new(VerifyEmailBody))
        .with_default_error(
            "invalid_code",
            "The link you clicked is no longer valid. Request a new verification e-mail.",
        )
        .with_verifier(email_matches_user)
}

fn email_matches_user(token: &ActionToken, context: &ActionContext<'_>) -> AuthResult<()> {
    match (token.note(EMAIL_NOTE), context.user.email.as_deref()) {
        (Some(claimed), Some(current)) if claimed.eq_ignore_ascii_case(current) => Ok(()),
        _ => Err(AuthError::invalid_code("e-mail address changed since the link was sent")),
    }
}

struct VerifyEmailBody;

#[async_trait]
impl ActionBody for VerifyEmailBody {
    async fn handle(&self, _token: &ActionToken, context: ActionContext<'_>) -> AuthResult<Outcome> {
        let ActionContext {
            services,
            mut session,
            fresh_session,
            mut user,
            mut event,
            ..
        } = context;

        user.email_verified = true;
        user.required_actions.remove(VERIFY_EMAIL_ACTION);
        services.identities.update_user(&user).await?;
        session.required_actions.remove(VERIFY_EMAIL_ACTION);

        event
            .detail(details::EMAIL, user.email.clone().unwrap_or_default())
            .success();
        tracing::info!(user_id = %user.id, session_id = %session.id, "E-mail address verified");

        if fresh_session {
            services.sessions.remove(&session.id).await?;
            return Ok(Page::info("Your e-mail address has been verified.").into());
        }

        session.set_authenticated_user(&user.id)?;
        services.flows.complete_authentication(session).await
    }
}

// ============================================================================
// execute-actions
// ============================================================================

/// Runs the required actions listed in the token, typically sent by an
/// administrator.
#[must_use]
pub fn execute_actions() -> ActionHandler {
    ActionHandler::new(
        EXECUTE_ACTIONS,
        EventType::ExecuteActions,
        Arc::new(ExecuteActionsBody),
    )
    .with_verifier(required_actions_present)
    .with_verifier(redirect_uri_allowed)
    .with_fresh_session(execute_actions_session)
}

fn required_actions(token: &ActionToken) -> impl Iterator<Item = &str> {
    token
        .note(REQUIRED_ACTIONS_NOTE)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
}

fn required_actions_present(token: &ActionToken, _context: &ActionContext<'_>) -> AuthResult<()> {
    if required_actions(token).next().is_none() {
        return Err(AuthError::invalid_code("no required actions in token"));
    }
    Ok(())
}

fn redirect_uri_allowed(token: &ActionToken, context: &ActionContext<'_>) -> AuthResult<()> {
    let Some(redirect_uri) = token.note(REDIRECT_URI_NOTE) else {
        return Ok(());
    };
    let client = context
        .services
        .realm
        .enabled_client(&context.session.client_id)?;
    client
        .verify_redirect_uri(Some(redirect_uri))
        .map(|_| ())
        .ok_or_else(|| AuthError::invalid_request("invalid redirect uri"))
}

fn execute_actions_session(
    token: &ActionToken,
    services: &AuthFlowServices,
) -> AuthResult<AuthSession> {
    let mut session = default_fresh_session(token, services)?;
    if let Some(redirect_uri) = token.note(REDIRECT_URI_NOTE) {
        let client = services.realm.enabled_client(&session.client_id)?;
        let verified = client
            .verify_redirect_uri(Some(redirect_uri))
            .ok_or_else(|| AuthError::invalid_request("invalid redirect uri"))?;
        session.redirect_uri = Some(verified.to_string());
    }
    Ok(session)
}

struct ExecuteActionsBody;

#[async_trait]
impl ActionBody for ExecuteActionsBody {
    async fn handle(&self, token: &ActionToken, context: ActionContext<'_>) -> AuthResult<Outcome> {
        let ActionContext {
            services,
            mut session,
            user,
            mut event,
            ..
        } = context;

        for action in required_actions(token) {
            session.required_actions.insert(action.to_string());
        }
        session.set_authenticated_user(&user.id)?;

        event
            .detail(details::ACTION, token.note(REQUIRED_ACTIONS_NOTE).unwrap_or_default())
            .success();
        services.flows.complete_authentication(session).await
    }
}

// ============================================================================
// idp-verify-account-via-email
// ============================================================================

/// Confirms by e-mail that a brokered identity may be linked to an existing
/// account during the first broker login.
#[must_use]
pub fn idp_verify_account_via_email() -> ActionHandler {
    ActionHandler::new(
        IDP_VERIFY_ACCOUNT_VIA_EMAIL,
        EventType::IdentityProviderLinkAccount,
        Arc::new(IdpVerifyAccountBody),
    )
    .with_default_error(
        "invalid_code",
        "The link you clicked is no longer valid. Start the login again.",
    )
    .with_verifier(broker_context_matches)
}

fn broker_context_matches(token: &ActionToken, context: &ActionContext<'_>) -> AuthResult<()> {
    let alias = token
        .note(IDP_ALIAS_NOTE)
        .ok_or_else(|| AuthError::invalid_code("identity provider missing in token"))?;
    if context.fresh_session {
        return Ok(());
    }

    let brokered = BrokeredIdentityContext::load(&context.session, BrokerStage::FirstLogin)?;
    if !brokered.is_some_and(|b| b.provider_alias == alias) {
        return Err(AuthError::invalid_code(
            "no first broker login in progress for this provider",
        ));
    }
    match context.session.core_note(CoreNote::ExistingUser) {
        Some(existing) if existing != token.user_id() => Err(AuthError::invalid_code(
            "token issued for another account",
        )),
        _ => Ok(()),
    }
}

struct IdpVerifyAccountBody;

#[async_trait]
impl ActionBody for IdpVerifyAccountBody {
    async fn handle(&self, token: &ActionToken, context: ActionContext<'_>) -> AuthResult<Outcome> {
        let ActionContext {
            services,
            mut session,
            fresh_session,
            mut event,
            execution,
            ..
        } = context;
        let alias = token
            .note(IDP_ALIAS_NOTE)
            .ok_or_else(|| AuthError::invalid_code("identity provider missing in token"))?;
        let provider_username = token.note(IDP_USERNAME_NOTE).unwrap_or_default();

        event
            .detail(details::IDENTITY_PROVIDER, alias)
            .detail(details::IDENTITY_PROVIDER_USERNAME, provider_username);

        if fresh_session {
            // Opened in another browser: mark the original login and let it continue there.
            if let Some(original_id) = token.auth_session_id() {
                if let Some(mut original) = services.sessions.get(original_id).await? {
                    original.set_core_note(CoreNote::BrokerLinkVerified, alias);
                    services.sessions.update(&original).await?;
                }
            }
            services.sessions.remove(&session.id).await?;
            event.success();
            return Ok(Page::info(format!(
                "Your account was successfully linked with {alias} account {provider_username}. \
                 Return to the original login window to continue."
            ))
            .into());
        }

        session.set_core_note(CoreNote::BrokerLinkVerified, alias);
        event.success();
        AccountLinkingEngine::new(services)
            .broker_login_flow(session, BrokerStage::FirstLogin, false, execution)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn token(notes: &[(&str, &str)]) -> ActionToken {
        ActionToken {
            jti: "n1".to_string(),
            typ: EXECUTE_ACTIONS.to_string(),
            sub: "user-1".to_string(),
            iat: 0,
            exp: 300,
            iss: "iss".to_string(),
            aud: "iss".to_string(),
            azp: None,
            asid: None,
            notes: notes
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_required_actions_parsing() {
        let t = token(&[(REQUIRED_ACTIONS_NOTE, "UPDATE_PASSWORD, ,VERIFY_EMAIL")]);
        assert_eq!(
            required_actions(&t).collect::<Vec<_>>(),
            vec!["UPDATE_PASSWORD", "VERIFY_EMAIL"]
        );
        assert_eq!(required_actions(&token(&[])).count(), 0);
    }

    #[test]
    fn test_handler_capabilities() {
        let handler = execute_actions();
        assert_eq!(handler.action_id, EXECUTE_ACTIONS);
        assert_eq!(handler.verifiers.len(), 2);
        assert!(!handler.can_use_repeatedly);

        let handler = idp_verify_account_via_email();
        assert_eq!(handler.event_type, EventType::IdentityProviderLinkAccount);
    }
}
