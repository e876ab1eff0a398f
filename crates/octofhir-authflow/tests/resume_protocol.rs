use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use octofhir_authflow::actions::builtin::{EMAIL_NOTE, VERIFY_EMAIL};
use octofhir_authflow::clock::{Clock, FixedClock};
use octofhir_authflow::config::{AuthFlowConfig, ClientConfig, SslRequired};
use octofhir_authflow::events::EventType;
use octofhir_authflow::store::{
    ConsumedTokenStore, IdentityStore, InMemoryConsumedTokenStore, InMemoryIdentityStore,
    InMemoryUserSessionStore, User, UserSession, UserSessionStore, VERIFY_EMAIL_ACTION,
};
use octofhir_authflow::{
    ActionBody, ActionContext, ActionHandler, ActionRegistry, ActionToken, ActionTokenCodec,
    AuthError, AuthFlowServices, AuthResult, AuthSession, InMemoryAuthSessionStore, Outcome, Page,
    PageKind, ResumeRequest, SessionDisposition, SessionResumptionCoordinator, SigningKeyRing,
};

const ACCEPT_TERMS: &str = "accept-terms";

struct Harness {
    services: Arc<AuthFlowServices>,
    clock: Arc<FixedClock>,
    sessions: Arc<InMemoryAuthSessionStore>,
    identities: Arc<InMemoryIdentityStore>,
    user_sessions: Arc<InMemoryUserSessionStore>,
}

/// Shows an info page and ends the session.
struct AcceptTerms;

#[async_trait]
impl ActionBody for AcceptTerms {
    async fn handle(&self, _token: &ActionToken, context: ActionContext<'_>) -> AuthResult<Outcome> {
        context.services.sessions.remove(&context.session.id).await?;
        Ok(Page::info("Terms accepted.").into())
    }
}

/// Consumed-token store whose backend is down.
struct UnavailableConsumedTokens;

#[async_trait]
impl ConsumedTokenStore for UnavailableConsumedTokens {
    async fn mark_used(&self, _key: &str, _expires_at: i64) -> AuthResult<bool> {
        Err(AuthError::storage("consumed token backend unavailable"))
    }

    async fn is_used(&self, _key: &str) -> AuthResult<bool> {
        Err(AuthError::storage("consumed token backend unavailable"))
    }

    async fn remove_expired(&self, _now: i64) -> AuthResult<usize> {
        Ok(0)
    }
}

fn config() -> AuthFlowConfig {
    let mut config = AuthFlowConfig::default();
    config.realm.ssl_required = SslRequired::None;
    config.clients = vec![
        ClientConfig {
            client_id: "portal".to_string(),
            redirect_uris: vec!["https://app.example.com/*".to_string()],
            base_url: Some("https://app.example.com/".to_string()),
            ..ClientConfig::default()
        },
        ClientConfig {
            client_id: "account".to_string(),
            base_url: Some("http://localhost:8080/account".to_string()),
            ..ClientConfig::default()
        },
    ];
    config
}

fn harness() -> Harness {
    harness_with(
        ActionRegistry::with_builtins(),
        Arc::new(InMemoryConsumedTokenStore::new()),
    )
}

fn harness_with(registry: ActionRegistry, consumed: Arc<dyn ConsumedTokenStore>) -> Harness {
    let clock = Arc::new(FixedClock::starting_now());
    let sessions = Arc::new(InMemoryAuthSessionStore::new(
        Duration::from_secs(1800),
        clock.clone(),
    ));
    let identities = Arc::new(InMemoryIdentityStore::new());
    let user_sessions = Arc::new(InMemoryUserSessionStore::new());
    let services = AuthFlowServices::builder(config())
        .clock(clock.clone())
        .sessions(sessions.clone())
        .identities(identities.clone())
        .user_sessions(user_sessions.clone())
        .consumed_tokens(consumed)
        .registry(registry)
        .build()
        .expect("services");
    Harness {
        services,
        clock,
        sessions,
        identities,
        user_sessions,
    }
}

async fn alice(h: &Harness) -> User {
    let mut user = User::new("alice").with_email("alice@example.com");
    user.required_actions.insert(VERIFY_EMAIL_ACTION.to_string());
    h.identities.add_user(&user).await.unwrap();
    user
}

fn verify_email_token(h: &Harness, user: &User, auth_session: Option<&str>) -> String {
    let mut builder = h
        .services
        .codec
        .builder(VERIFY_EMAIL, &user.id, Duration::from_secs(300))
        .issued_for("portal")
        .note(EMAIL_NOTE, "alice@example.com");
    if let Some(id) = auth_session {
        builder = builder.auth_session(id);
    }
    builder.sign().unwrap()
}

fn request(token: &str) -> ResumeRequest {
    ResumeRequest {
        token: token.to_string(),
        ..ResumeRequest::default()
    }
}

#[tokio::test]
async fn test_token_is_single_use_across_sessions() {
    let h = harness();
    let user = alice(&h).await;
    let token = verify_email_token(&h, &user, None);
    let coordinator = SessionResumptionCoordinator::new(&h.services);

    let first = coordinator.resume(request(&token)).await.unwrap();
    assert_eq!(first.disposition, SessionDisposition::Fresh);
    assert_eq!(first.outcome.page().unwrap().kind, PageKind::Info);
    // Info page ends the fresh session.
    assert!(h.services.sessions.get(&first.session_id).await.unwrap().is_none());

    let stored = h.identities.get_user(&user.id).await.unwrap().unwrap();
    assert!(stored.email_verified);
    assert!(!stored.required_actions.contains(VERIFY_EMAIL_ACTION));

    let replay = coordinator.resume(request(&token)).await.unwrap_err();
    assert_eq!(replay.error, AuthError::AlreadyUsed);
    assert_eq!(
        replay.message,
        h.services.registry.resolve(VERIFY_EMAIL).unwrap().default_error_message
    );
}

#[tokio::test]
async fn test_expired_and_forged_tokens_are_distinguished() {
    let h = harness();
    let user = alice(&h).await;
    let token = verify_email_token(&h, &user, None);

    let foreign = ActionTokenCodec::new(
        SigningKeyRing::generate(),
        h.services.codec.issuer(),
        h.clock.clone(),
    );
    let forged = foreign
        .builder(VERIFY_EMAIL, &user.id, Duration::from_secs(300))
        .note(EMAIL_NOTE, "alice@example.com")
        .sign()
        .unwrap();

    h.clock.advance(time::Duration::seconds(301));
    let coordinator = SessionResumptionCoordinator::new(&h.services);

    let expired = coordinator.resume(request(&token)).await.unwrap_err();
    assert_eq!(expired.error, AuthError::Expired);
    assert_eq!(expired.message, AuthError::Expired.user_message());

    // Bad signature wins over expiry.
    let forged = coordinator.resume(request(&forged)).await.unwrap_err();
    assert_eq!(forged.error, AuthError::BadSignature);

    let garbage = coordinator.resume(request("not-a-token")).await.unwrap_err();
    assert_eq!(garbage.error, AuthError::BadSignature);

    let stored = h.identities.get_user(&user.id).await.unwrap().unwrap();
    assert!(!stored.email_verified);
}

#[tokio::test]
async fn test_expired_token_restarts_browser_session() {
    let h = harness();
    let user = alice(&h).await;
    let token = verify_email_token(&h, &user, Some("browser-1"));

    let session = AuthSession::new("browser-1", "portal", h.clock.now());
    h.services.sessions.create(&session).await.unwrap();
    h.clock.advance(time::Duration::seconds(301));

    let resumption = SessionResumptionCoordinator::new(&h.services)
        .resume(ResumeRequest {
            browser_session_id: Some("browser-1".to_string()),
            ..request(&token)
        })
        .await
        .unwrap();

    assert_eq!(resumption.disposition, SessionDisposition::RestartedExpired);
    assert_eq!(resumption.session_id, "browser-1");
    let page = resumption.outcome.page().unwrap();
    assert_eq!(page.form.as_deref(), Some("login-form"));
    assert_eq!(
        page.message.as_deref(),
        Some(AuthError::Expired.user_message().as_str())
    );
    assert!(h.services.sessions.get("browser-1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_matching_browser_session_is_reused_and_completed() {
    let h = harness();
    let user = alice(&h).await;
    let token = verify_email_token(&h, &user, Some("browser-1"));

    let session = AuthSession::new("browser-1", "portal", h.clock.now());
    h.services.sessions.create(&session).await.unwrap();

    let resumption = SessionResumptionCoordinator::new(&h.services)
        .resume(ResumeRequest {
            browser_session_id: Some("browser-1".to_string()),
            ..request(&token)
        })
        .await
        .unwrap();

    assert_eq!(resumption.disposition, SessionDisposition::Reused);
    let url = resumption.outcome.redirect_url().unwrap();
    assert!(url.as_str().starts_with("https://app.example.com/"));
    assert!(url.query_pairs().any(|(k, v)| k == "session_state" && v == "browser-1"));

    assert!(h.services.sessions.get("browser-1").await.unwrap().is_none());
    let user_session = h.user_sessions.get("browser-1").await.unwrap().unwrap();
    assert_eq!(user_session.user_id, user.id);
}

#[tokio::test]
async fn test_token_for_session_of_other_user_is_rejected() {
    let h = harness();
    let user = alice(&h).await;
    let bob = User::new("bob");
    h.identities.add_user(&bob).await.unwrap();
    h.user_sessions
        .create(&UserSession::new("bob-session", &bob.id, h.clock.now()))
        .await
        .unwrap();

    let token = verify_email_token(&h, &user, Some("bob-session"));
    let coordinator = SessionResumptionCoordinator::new(&h.services);

    let error = coordinator.resume(request(&token)).await.unwrap_err();
    assert_eq!(error.error, AuthError::SessionHijackSuspected);

    // Also when only the browser's identity cookie points at another user.
    let token = verify_email_token(&h, &user, Some("gone"));
    let error = coordinator
        .resume(ResumeRequest {
            user_session_id: Some("bob-session".to_string()),
            ..request(&token)
        })
        .await
        .unwrap_err();
    assert_eq!(error.error, AuthError::SessionHijackSuspected);

    let stored = h.identities.get_user(&user.id).await.unwrap().unwrap();
    assert!(!stored.email_verified);
}

#[tokio::test]
async fn test_rejected_token_discards_browser_session() {
    let h = harness();
    let user = alice(&h).await;
    let bob = User::new("bob");
    h.identities.add_user(&bob).await.unwrap();
    h.user_sessions
        .create(&UserSession::new("bob-session", &bob.id, h.clock.now()))
        .await
        .unwrap();
    let session = AuthSession::new("browser-1", "portal", h.clock.now());
    h.services.sessions.create(&session).await.unwrap();

    let token = verify_email_token(&h, &user, Some("bob-session"));
    let error = SessionResumptionCoordinator::new(&h.services)
        .resume(ResumeRequest {
            browser_session_id: Some("browser-1".to_string()),
            ..request(&token)
        })
        .await
        .unwrap_err();

    assert_eq!(error.error, AuthError::SessionHijackSuspected);
    assert!(h.services.sessions.get("browser-1").await.unwrap().is_none());
    assert!(h.sessions.is_empty());
}

#[tokio::test]
async fn test_disabled_user_tears_down_fresh_session() {
    let h = harness();
    let mut user = alice(&h).await;
    user.enabled = false;
    h.identities.update_user(&user).await.unwrap();
    let token = verify_email_token(&h, &user, None);

    let error = SessionResumptionCoordinator::new(&h.services)
        .resume(request(&token))
        .await
        .unwrap_err();
    assert!(matches!(error.error, AuthError::InvalidUser { .. }));
    assert!(h.sessions.is_empty());
}

#[tokio::test]
async fn test_storage_failure_tears_down_fresh_session() {
    let h = harness_with(
        ActionRegistry::with_builtins(),
        Arc::new(UnavailableConsumedTokens),
    );
    let user = alice(&h).await;
    let token = verify_email_token(&h, &user, None);

    let error = SessionResumptionCoordinator::new(&h.services)
        .resume(request(&token))
        .await
        .unwrap_err();

    assert!(matches!(error.error, AuthError::Storage { .. }));
    assert!(h.sessions.is_empty());
    let stored = h.identities.get_user(&user.id).await.unwrap().unwrap();
    assert!(!stored.email_verified);
}

#[tokio::test]
async fn test_repeatable_action_token_resumes_twice() {
    let mut registry = ActionRegistry::with_builtins();
    registry.register(
        ActionHandler::new(ACCEPT_TERMS, EventType::ExecuteActionToken, Arc::new(AcceptTerms))
            .repeatable(),
    );
    let h = harness_with(registry, Arc::new(InMemoryConsumedTokenStore::new()));
    let user = alice(&h).await;
    let token = h
        .services
        .codec
        .builder(ACCEPT_TERMS, &user.id, Duration::from_secs(300))
        .issued_for("portal")
        .sign()
        .unwrap();
    let coordinator = SessionResumptionCoordinator::new(&h.services);

    for _ in 0..2 {
        let resumption = coordinator.resume(request(&token)).await.unwrap();
        assert_eq!(resumption.disposition, SessionDisposition::Fresh);
        let page = resumption.outcome.page().unwrap();
        assert_eq!(page.kind, PageKind::Info);
        assert_eq!(page.message.as_deref(), Some("Terms accepted."));
    }
    assert!(h.sessions.is_empty());
}

#[tokio::test]
async fn test_unknown_action_is_rejected_before_any_session_work() {
    let h = harness();
    let user = alice(&h).await;
    let token = h
        .services
        .codec
        .issue("reset-credentials", &user.id, Duration::from_secs(300))
        .unwrap();

    let error = SessionResumptionCoordinator::new(&h.services)
        .resume(request(&token))
        .await
        .unwrap_err();
    assert_eq!(error.error, AuthError::unknown_action("reset-credentials"));
}

#[tokio::test]
async fn test_changed_email_invalidates_verification_link() {
    let h = harness();
    let mut user = alice(&h).await;
    let token = verify_email_token(&h, &user, None);
    user.email = Some("alice@new.example.com".to_string());
    h.identities.update_user(&user).await.unwrap();

    let error = SessionResumptionCoordinator::new(&h.services)
        .resume(request(&token))
        .await
        .unwrap_err();
    assert!(matches!(error.error, AuthError::InvalidCode { .. }));
    assert!(error.message.contains("no longer valid"));
}
