//! Login action endpoints.

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use serde::Deserialize;

use super::{AuthFlowState, Connection, auth_session_cookie, auth_session_id, user_session_id};
use crate::broker::{AccountLinkingEngine, BrokerStage};
use crate::error::AuthError;
use crate::outcome::Outcome;
use crate::realm::ConnectionInfo;
use crate::resume::{ResumeRequest, SessionResumptionCoordinator};

/// Query of the action token link.
#[derive(Debug, Deserialize)]
pub struct ActionTokenParams {
    /// The encoded action token.
    pub key: String,
    #[serde(default)]
    pub execution: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Query of the broker login flow endpoints.
#[derive(Debug, Deserialize)]
pub struct BrokerFlowParams {
    pub code: String,
    #[serde(default)]
    pub execution: Option<String>,
    pub client_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RestartParams {
    #[serde(default)]
    pub client_id: Option<String>,
}

/// GET|POST /login-actions/action-token
///
/// Resumes or starts a flow from an action token. The auth-session cookie is
/// pointed at the session the action ran in.
pub async fn action_token(
    State(state): State<AuthFlowState>,
    Query(params): Query<ActionTokenParams>,
    Connection(connection): Connection,
    jar: CookieJar,
) -> Response {
    let services = &state.services;
    let cookies = &services.config.sessions;
    let request = ResumeRequest {
        token: params.key,
        browser_session_id: auth_session_id(&jar, cookies),
        user_session_id: user_session_id(&jar, cookies),
        execution: params.execution,
        client_id: params.client_id,
        connection,
    };

    match SessionResumptionCoordinator::new(services).resume(request).await {
        Ok(resumption) => {
            let jar = jar.add(auth_session_cookie(cookies, resumption.session_id));
            (jar, resumption.outcome).into_response()
        }
        Err(error) => error.into_response(),
    }
}

/// GET /login-actions/first-broker-login
pub async fn first_broker_login_get(
    State(state): State<AuthFlowState>,
    Query(params): Query<BrokerFlowParams>,
    Connection(connection): Connection,
) -> Result<Outcome, AuthError> {
    broker_flow(&state, BrokerStage::FirstLogin, params, &connection, false).await
}

/// POST /login-actions/first-broker-login
pub async fn first_broker_login_post(
    State(state): State<AuthFlowState>,
    Query(params): Query<BrokerFlowParams>,
    Connection(connection): Connection,
) -> Result<Outcome, AuthError> {
    broker_flow(&state, BrokerStage::FirstLogin, params, &connection, true).await
}

/// GET /login-actions/post-broker-login
pub async fn post_broker_login_get(
    State(state): State<AuthFlowState>,
    Query(params): Query<BrokerFlowParams>,
    Connection(connection): Connection,
) -> Result<Outcome, AuthError> {
    broker_flow(&state, BrokerStage::PostLogin, params, &connection, false).await
}

/// POST /login-actions/post-broker-login
pub async fn post_broker_login_post(
    State(state): State<AuthFlowState>,
    Query(params): Query<BrokerFlowParams>,
    Connection(connection): Connection,
) -> Result<Outcome, AuthError> {
    broker_flow(&state, BrokerStage::PostLogin, params, &connection, true).await
}

async fn broker_flow(
    state: &AuthFlowState,
    stage: BrokerStage,
    params: BrokerFlowParams,
    connection: &ConnectionInfo,
    action_submission: bool,
) -> Result<Outcome, AuthError> {
    let services = &state.services;
    services.realm.check_request(connection)?;
    AccountLinkingEngine::new(services)
        .resume_broker_flow(
            stage,
            &params.code,
            &params.client_id,
            action_submission,
            params.execution,
        )
        .await
}

/// GET /login-actions/restart
///
/// Throws away the progress of the browser's auth session and starts the
/// login again.
pub async fn restart(
    State(state): State<AuthFlowState>,
    Query(params): Query<RestartParams>,
    Connection(connection): Connection,
    jar: CookieJar,
) -> Result<Outcome, AuthError> {
    let services = &state.services;
    services.realm.check_request(&connection)?;

    let session_id = auth_session_id(&jar, &services.config.sessions)
        .ok_or_else(|| AuthError::invalid_request("no auth session to restart"))?;
    let _lock = services.sessions.lock(&session_id).await;
    let session = services
        .sessions
        .get(&session_id)
        .await?
        .ok_or_else(|| AuthError::invalid_request("no auth session to restart"))?;
    if params
        .client_id
        .as_deref()
        .is_some_and(|c| c != session.client_id)
    {
        return Err(AuthError::invalid_request("auth session belongs to another client"));
    }

    tracing::debug!(session_id = %session_id, "Restarting login on request");
    services.flows.restart(session, None).await
}
