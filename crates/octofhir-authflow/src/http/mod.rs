//! HTTP handlers for the flow endpoints.
//!
//! # Routes
//!
//! ```text
//! GET|POST /login-actions/action-token        ?key&execution&client_id
//! GET|POST /login-actions/first-broker-login  ?code&execution&client_id
//! GET|POST /login-actions/post-broker-login   ?code&execution&client_id
//! GET      /login-actions/restart             ?client_id
//! GET      /broker/{provider}/link            ?redirect_uri&client_id&nonce&hash
//! GET|POST /broker/{provider}/login           ?code&client_id
//! GET      /broker/{provider}/endpoint        provider callback
//! GET      /broker/after-first-broker-login   ?code&client_id
//! GET      /broker/after-post-broker-login    ?code&client_id
//! ```
//!
//! - [`login_actions`] - Action tokens, broker login flows and restarts
//! - [`broker`] - Provider logins, callbacks and client-initiated linking

pub mod broker;
pub mod login_actions;
mod response;

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::Router;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::HeaderMap;
use axum::http::request::Parts;
use axum::routing::get;
use axum_extra::extract::CookieJar;
use cookie::{Cookie, SameSite};

use crate::config::SessionConfig;
use crate::realm::ConnectionInfo;
use crate::services::AuthFlowServices;

/// State shared by every handler.
#[derive(Clone)]
pub struct AuthFlowState {
    pub services: Arc<AuthFlowServices>,
}

impl AuthFlowState {
    #[must_use]
    pub fn new(services: Arc<AuthFlowServices>) -> Self {
        Self { services }
    }
}

/// Builds the router for all flow endpoints.
pub fn router(services: Arc<AuthFlowServices>) -> Router {
    Router::new()
        .route(
            "/login-actions/action-token",
            get(login_actions::action_token).post(login_actions::action_token),
        )
        .route(
            "/login-actions/first-broker-login",
            get(login_actions::first_broker_login_get).post(login_actions::first_broker_login_post),
        )
        .route(
            "/login-actions/post-broker-login",
            get(login_actions::post_broker_login_get).post(login_actions::post_broker_login_post),
        )
        .route("/login-actions/restart", get(login_actions::restart))
        .route("/broker/{provider}/link", get(broker::client_initiated_link))
        .route(
            "/broker/{provider}/login",
            get(broker::login).post(broker::login),
        )
        .route("/broker/{provider}/endpoint", get(broker::endpoint))
        .route(
            "/broker/after-first-broker-login",
            get(broker::after_first_broker_login),
        )
        .route(
            "/broker/after-post-broker-login",
            get(broker::after_post_broker_login),
        )
        .with_state(AuthFlowState::new(services))
}

// ============================================================================
// Request helpers
// ============================================================================

/// Transport facts of the request: TLS, peer address and origin.
pub struct Connection(pub ConnectionInfo);

impl FromRequestParts<AuthFlowState> for Connection {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AuthFlowState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let trust_proxy = state.services.config.sessions.trust_proxy_headers;
        Ok(Self(connection_info(&parts.headers, peer, trust_proxy)))
    }
}

/// Reads TLS and peer address of a request.
///
/// With `trust_proxy` the proxy headers win over the socket peer. Without
/// it they are ignored: the request counts as plain HTTP from `peer`.
pub(crate) fn connection_info(
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    trust_proxy: bool,
) -> ConnectionInfo {
    let origin = headers
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if !trust_proxy {
        return ConnectionInfo {
            secure: false,
            remote_addr: peer,
            origin,
        };
    }

    let secure = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|proto| proto.eq_ignore_ascii_case("https"));

    // X-Forwarded-For can contain multiple IPs: "client, proxy1, proxy2"
    let remote_addr = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|ip| ip.trim().parse::<IpAddr>().ok())
        .or(peer);

    ConnectionInfo {
        secure,
        remote_addr,
        origin,
    }
}

pub(crate) fn auth_session_id(jar: &CookieJar, config: &SessionConfig) -> Option<String> {
    jar.get(&config.auth_session_cookie)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn user_session_id(jar: &CookieJar, config: &SessionConfig) -> Option<String> {
    jar.get(&config.identity_cookie)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}

/// Cookie pointing the browser at `session_id`.
pub(crate) fn auth_session_cookie(config: &SessionConfig, session_id: String) -> Cookie<'static> {
    Cookie::build((config.auth_session_cookie.clone(), session_id))
        .http_only(true)
        .secure(config.secure_cookies)
        .same_site(SameSite::Lax)
        .path("/")
        .build()
}
