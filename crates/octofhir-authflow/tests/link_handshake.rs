use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use octofhir_authflow::clock::{Clock, FixedClock};
use octofhir_authflow::config::{AuthFlowConfig, ClientConfig, IdentityProviderConfig, SslRequired};
use octofhir_authflow::realm::ConnectionInfo;
use octofhir_authflow::session::{IDENTITY_PROVIDER_NOTE, LinkingIntent};
use octofhir_authflow::store::{
    ClientSession, IdentityStore, InMemoryIdentityStore, InMemoryUserSessionStore,
    MANAGE_ACCOUNT_LINKS_ROLE, MANAGE_ACCOUNT_ROLE, User, UserSession, UserSessionStore,
};
use octofhir_authflow::{
    AccountLinkingEngine, AuthError, AuthFlowServices, AuthResult, BrokerCallback, BrokerState,
    BrokeredIdentityContext, ClientInitiatedLinking, IdentityProvider, LinkInitiation,
    LinkRejection, LinkRequest, LoginRequest, compute_link_hash, router,
};
use tokio::task::JoinHandle;
use url::Url;

const LINKED_URI: &str = "https://app.example.com/linked";

struct ParamsProvider;

#[async_trait]
impl IdentityProvider for ParamsProvider {
    fn alias(&self) -> &str {
        "github"
    }

    async fn login_redirect(&self, request: &LoginRequest) -> AuthResult<Url> {
        let mut url = Url::parse("https://idp.example.com/authorize").unwrap();
        url.query_pairs_mut().append_pair("state", &request.state);
        Ok(url)
    }

    async fn handle_callback(&self, params: &HashMap<String, String>) -> AuthResult<BrokerCallback> {
        let context = BrokeredIdentityContext::new("github", params["sub"].clone())
            .with_username(params["username"].clone());
        Ok(BrokerCallback::Authenticated(context))
    }
}

struct Harness {
    services: Arc<AuthFlowServices>,
    identities: Arc<InMemoryIdentityStore>,
    user_sessions: Arc<InMemoryUserSessionStore>,
    alice: User,
}

fn config() -> AuthFlowConfig {
    let mut config = AuthFlowConfig::default();
    config.realm.ssl_required = SslRequired::None;
    config.clients = vec![ClientConfig {
        client_id: "portal".to_string(),
        redirect_uris: vec!["https://app.example.com/*".to_string()],
        base_url: Some("https://app.example.com/".to_string()),
        ..ClientConfig::default()
    }];
    config.identity_providers = vec![IdentityProviderConfig {
        alias: "github".to_string(),
        ..IdentityProviderConfig::default()
    }];
    config
}

/// Alice is logged in to `portal` with session `us-1`.
async fn harness() -> Harness {
    harness_with(config()).await
}

async fn harness_with(config: AuthFlowConfig) -> Harness {
    let clock = Arc::new(FixedClock::starting_now());
    let identities = Arc::new(InMemoryIdentityStore::new());
    let user_sessions = Arc::new(InMemoryUserSessionStore::new());
    let services = AuthFlowServices::builder(config)
        .clock(clock.clone())
        .identities(identities.clone())
        .user_sessions(user_sessions.clone())
        .provider(Arc::new(ParamsProvider))
        .build()
        .expect("services");

    let alice = User::new("alice").with_role(MANAGE_ACCOUNT_ROLE);
    identities.add_user(&alice).await.unwrap();
    let session = UserSession::new("us-1", &alice.id, clock.now())
        .with_client_session(ClientSession::new("portal").with_role(MANAGE_ACCOUNT_ROLE));
    user_sessions.create(&session).await.unwrap();

    Harness {
        services,
        identities,
        user_sessions,
        alice,
    }
}

fn link_request(provider: &str, user_session_id: Option<&str>) -> LinkRequest {
    LinkRequest {
        provider_alias: provider.to_string(),
        redirect_uri: LINKED_URI.to_string(),
        client_id: "portal".to_string(),
        nonce: Some("n1".to_string()),
        hash: Some(compute_link_hash("n1", "us-1", "portal", provider)),
        user_session_id: user_session_id.map(str::to_string),
        connection: ConnectionInfo::default(),
    }
}

fn param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

fn assert_rejected(initiation: LinkInitiation, expected: LinkRejection) {
    let LinkInitiation::Rejected { reason, redirect } = initiation else {
        panic!("expected rejection, got {initiation:?}");
    };
    assert_eq!(reason, expected);
    assert!(redirect.as_str().starts_with(LINKED_URI));
    assert_eq!(param(&redirect, "link_error").as_deref(), Some(expected.as_str()));
    assert_eq!(param(&redirect, "nonce").as_deref(), Some("n1"));
}

async fn start(h: &Harness) -> String {
    let initiation = ClientInitiatedLinking::new(&h.services)
        .initiate(link_request("github", Some("us-1")))
        .await
        .unwrap();
    let LinkInitiation::Started { session_id, outcome } = initiation else {
        panic!("expected linking to start, got {initiation:?}");
    };
    assert_eq!(session_id, "us-1");
    let url = outcome.redirect_url().expect("redirect to provider");
    assert_eq!(url.host_str(), Some("idp.example.com"));
    param(url, "state").expect("state")
}

fn callback(state: &str, sub: &str) -> HashMap<String, String> {
    HashMap::from([
        ("state".to_string(), state.to_string()),
        ("sub".to_string(), sub.to_string()),
        ("username".to_string(), "octocat".to_string()),
    ])
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_rejections_are_reported_to_the_application() {
    let h = harness().await;
    let linking = ClientInitiatedLinking::new(&h.services);

    let initiation = linking.initiate(link_request("github", None)).await.unwrap();
    assert_rejected(initiation, LinkRejection::NotLoggedIn);

    let mut request = link_request("github", Some("us-1"));
    request.hash = Some(compute_link_hash("n2", "us-1", "portal", "github"));
    assert_rejected(linking.initiate(request).await.unwrap(), LinkRejection::InvalidToken);

    let initiation = linking
        .initiate(link_request("gitlab", Some("us-1")))
        .await
        .unwrap();
    assert_rejected(initiation, LinkRejection::UnknownIdentityProvider);

    // Logged in, but never to this client.
    h.user_sessions
        .create(&UserSession::new("us-2", &h.alice.id, time::OffsetDateTime::now_utc()))
        .await
        .unwrap();
    let mut request = link_request("github", Some("us-2"));
    request.hash = Some(compute_link_hash("n1", "us-2", "portal", "github"));
    assert_rejected(linking.initiate(request).await.unwrap(), LinkRejection::NotLoggedIn);

    assert_eq!(h.identities.link_count().await, 0);
    assert!(h.services.sessions.get("us-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_client_session_needs_account_management_role() {
    let h = harness().await;
    let session = UserSession::new("us-3", &h.alice.id, time::OffsetDateTime::now_utc())
        .with_client_session(ClientSession::new("portal"));
    h.user_sessions.create(&session).await.unwrap();

    let mut request = link_request("github", Some("us-3"));
    request.hash = Some(compute_link_hash("n1", "us-3", "portal", "github"));
    let initiation = ClientInitiatedLinking::new(&h.services)
        .initiate(request)
        .await
        .unwrap();
    assert_rejected(initiation, LinkRejection::NotAllowed);

    let session = UserSession::new("us-4", &h.alice.id, time::OffsetDateTime::now_utc())
        .with_client_session(ClientSession::new("portal").with_role(MANAGE_ACCOUNT_LINKS_ROLE));
    h.user_sessions.create(&session).await.unwrap();
    let mut request = link_request("github", Some("us-4"));
    request.hash = Some(compute_link_hash("n1", "us-4", "portal", "github"));
    let initiation = ClientInitiatedLinking::new(&h.services)
        .initiate(request)
        .await
        .unwrap();
    assert!(matches!(initiation, LinkInitiation::Started { .. }));
}

#[tokio::test]
async fn test_malformed_requests_fail_outright() {
    let h = harness().await;
    let linking = ClientInitiatedLinking::new(&h.services);

    let mut request = link_request("github", Some("us-1"));
    request.redirect_uri = "https://evil.example.com/".to_string();
    assert!(matches!(
        linking.initiate(request).await,
        Err(AuthError::InvalidRequest { .. })
    ));

    let mut request = link_request("github", Some("us-1"));
    request.nonce = None;
    assert!(matches!(
        linking.initiate(request).await,
        Err(AuthError::InvalidRequest { .. })
    ));

    let mut request = link_request("github", Some("us-1"));
    request.client_id = "unknown".to_string();
    assert!(matches!(
        linking.initiate(request).await,
        Err(AuthError::InvalidRequest { .. })
    ));

    let mut request = link_request("github", Some("us-1"));
    request.connection.origin = Some("https://evil.example.com".to_string());
    assert!(matches!(
        linking.initiate(request).await,
        Err(AuthError::InvalidRequest { .. })
    ));

    let mut request = link_request("github", Some("us-1"));
    request.connection.origin = Some("https://app.example.com".to_string());
    assert!(linking.initiate(request).await.is_ok());
}

#[tokio::test]
async fn test_failed_provider_redirect_drops_linking_session() {
    let mut config = config();
    config.identity_providers.push(IdentityProviderConfig {
        alias: "gitlab".to_string(),
        ..IdentityProviderConfig::default()
    });
    let h = harness_with(config).await;

    let mut request = link_request("gitlab", Some("us-1"));
    request.hash = Some(compute_link_hash("n1", "us-1", "portal", "gitlab"));
    let error = ClientInitiatedLinking::new(&h.services)
        .initiate(request)
        .await
        .unwrap_err();

    assert!(matches!(error, AuthError::IdentityProvider { .. }));
    assert!(h.services.sessions.get("us-1").await.unwrap().is_none());
}

// ============================================================================
// Linking round trip
// ============================================================================

#[tokio::test]
async fn test_linking_round_trip_links_logged_in_user() {
    let h = harness().await;
    let state = start(&h).await;

    let step = AccountLinkingEngine::new(&h.services)
        .handle_endpoint("github", callback(&state, "gh-9"))
        .await
        .unwrap();
    assert_eq!(step.state, BrokerState::LinkExistingSession);
    assert_eq!(step.outcome.redirect_url().unwrap().as_str(), LINKED_URI);

    let linked = h
        .identities
        .find_user_by_federated_identity("github", "gh-9")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(linked.id, h.alice.id);

    let user_session = h.user_sessions.get("us-1").await.unwrap().unwrap();
    assert_eq!(user_session.note(IDENTITY_PROVIDER_NOTE), Some("github"));
    assert!(h.services.sessions.get("us-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_identity_of_another_user_is_not_relinked() {
    let h = harness().await;
    let bob = User::new("bob");
    h.identities.add_user(&bob).await.unwrap();
    let link = BrokeredIdentityContext::new("github", "gh-9")
        .with_username("octocat")
        .to_link(&bob.id, time::OffsetDateTime::now_utc());
    h.identities.add_federated_identity(&link).await.unwrap();

    let state = start(&h).await;
    let error = AccountLinkingEngine::new(&h.services)
        .handle_endpoint("github", callback(&state, "gh-9"))
        .await
        .unwrap_err();

    assert!(matches!(error, AuthError::AlreadyLinked { .. }));
    assert_eq!(h.identities.link_count().await, 1);
    assert!(
        h.identities
            .federated_identities(&h.alice.id)
            .await
            .unwrap()
            .is_empty()
    );
    assert!(h.services.sessions.get("us-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_mismatched_linking_intent_expires_linking_session() {
    let h = harness().await;
    let state = start(&h).await;

    let mut session = h.services.sessions.get("us-1").await.unwrap().unwrap();
    session
        .set_linking_intent(&LinkingIntent::new("us-1", "portal", "gitlab"))
        .unwrap();
    h.services.sessions.update(&session).await.unwrap();

    let error = AccountLinkingEngine::new(&h.services)
        .handle_endpoint("github", callback(&state, "gh-9"))
        .await
        .unwrap_err();

    assert_eq!(error, AuthError::LinkingSessionExpired);
    assert!(h.services.sessions.get("us-1").await.unwrap().is_none());
    assert_eq!(h.identities.link_count().await, 0);
}

#[tokio::test]
async fn test_linking_intent_dies_with_user_session() {
    let h = harness().await;
    let state = start(&h).await;
    h.user_sessions.remove("us-1").await.unwrap();

    let error = AccountLinkingEngine::new(&h.services)
        .handle_endpoint("github", callback(&state, "gh-9"))
        .await
        .unwrap_err();

    assert_eq!(error, AuthError::LinkingSessionExpired);
    assert!(h.services.sessions.get("us-1").await.unwrap().is_none());
    assert_eq!(h.identities.link_count().await, 0);
}

#[tokio::test]
async fn test_user_without_manage_account_cannot_link() {
    let h = harness().await;
    let mut alice = h.alice.clone();
    alice.roles.clear();
    h.identities.update_user(&alice).await.unwrap();

    let state = start(&h).await;
    let error = AccountLinkingEngine::new(&h.services)
        .handle_endpoint("github", callback(&state, "gh-9"))
        .await
        .unwrap_err();
    assert!(matches!(error, AuthError::NotAllowed { .. }));
    assert_eq!(h.identities.link_count().await, 0);
}

// ============================================================================
// HTTP
// ============================================================================

async fn serve(services: Arc<AuthFlowServices>) -> (String, tokio::sync::oneshot::Sender<()>, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let app = router(services);
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await;
    });

    (format!("http://{addr}"), tx, server)
}

#[tokio::test]
async fn test_link_endpoint_over_http() {
    let h = harness().await;
    let (base, shutdown_tx, handle) = serve(h.services.clone()).await;
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let hash = compute_link_hash("n1", "us-1", "portal", "github");
    let query = [
        ("redirect_uri", LINKED_URI),
        ("client_id", "portal"),
        ("nonce", "n1"),
        ("hash", hash.as_str()),
    ];

    // Without the identity cookie the application gets the request back.
    let resp = client
        .get(format!("{base}/broker/github/link"))
        .query(&query)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::SEE_OTHER);
    let location = Url::parse(resp.headers()["location"].to_str().unwrap()).unwrap();
    assert_eq!(param(&location, "link_error").as_deref(), Some("not_logged_in"));

    let resp = client
        .get(format!("{base}/broker/github/link"))
        .query(&query)
        .header("cookie", "AUTHFLOW_IDENTITY=us-1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::SEE_OTHER);
    let location = Url::parse(resp.headers()["location"].to_str().unwrap()).unwrap();
    assert_eq!(location.host_str(), Some("idp.example.com"));
    let cookie = resp.headers()["set-cookie"].to_str().unwrap();
    assert!(cookie.starts_with("AUTH_SESSION_ID=us-1"));

    // Foreign redirect URIs are refused without a redirect.
    let resp = client
        .get(format!("{base}/broker/github/link"))
        .query(&[
            ("redirect_uri", "https://evil.example.com/"),
            ("client_id", "portal"),
            ("nonce", "n1"),
            ("hash", hash.as_str()),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "invalid_request");

    let _ = shutdown_tx.send(());
    let _ = handle.await;
}
