//! Identity broker endpoints.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Redirect, Response};
use axum_extra::extract::CookieJar;
use serde::Deserialize;

use super::{AuthFlowState, Connection, auth_session_cookie, user_session_id};
use crate::broker::AccountLinkingEngine;
use crate::error::AuthError;
use crate::linking::{ClientInitiatedLinking, LinkInitiation, LinkRequest};
use crate::outcome::Outcome;

/// Query of the client-initiated link request.
#[derive(Debug, Deserialize)]
pub struct LinkParams {
    pub redirect_uri: String,
    pub client_id: String,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
}

/// Query carrying a session code.
#[derive(Debug, Deserialize)]
pub struct CodeParams {
    pub code: String,
    pub client_id: String,
}

/// GET /broker/{provider}/link
pub async fn client_initiated_link(
    State(state): State<AuthFlowState>,
    Path(provider): Path<String>,
    Query(params): Query<LinkParams>,
    Connection(connection): Connection,
    jar: CookieJar,
) -> Result<Response, AuthError> {
    let services = &state.services;
    let request = LinkRequest {
        provider_alias: provider,
        redirect_uri: params.redirect_uri,
        client_id: params.client_id,
        nonce: params.nonce,
        hash: params.hash,
        user_session_id: user_session_id(&jar, &services.config.sessions),
        connection,
    };

    match ClientInitiatedLinking::new(services).initiate(request).await? {
        LinkInitiation::Started {
            session_id,
            outcome,
        } => {
            let jar = jar.add(auth_session_cookie(&services.config.sessions, session_id));
            Ok((jar, outcome).into_response())
        }
        LinkInitiation::Rejected { redirect, .. } => {
            Ok(Redirect::to(redirect.as_str()).into_response())
        }
    }
}

/// GET|POST /broker/{provider}/login
pub async fn login(
    State(state): State<AuthFlowState>,
    Path(provider): Path<String>,
    Query(params): Query<CodeParams>,
    Connection(connection): Connection,
) -> Result<Outcome, AuthError> {
    let services = &state.services;
    services.realm.check_request(&connection)?;
    AccountLinkingEngine::new(services)
        .start_login(&provider, &params.code, &params.client_id)
        .await
}

/// GET /broker/{provider}/endpoint
///
/// The provider redirects here after the user authenticated (or gave up).
pub async fn endpoint(
    State(state): State<AuthFlowState>,
    Path(provider): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    Connection(connection): Connection,
) -> Result<Outcome, AuthError> {
    let services = &state.services;
    services.realm.check_request(&connection)?;
    let step = AccountLinkingEngine::new(services)
        .handle_endpoint(&provider, params)
        .await?;
    tracing::debug!(provider = %provider, state = ?step.state, "Broker callback handled");
    Ok(step.outcome)
}

/// GET /broker/after-first-broker-login
pub async fn after_first_broker_login(
    State(state): State<AuthFlowState>,
    Query(params): Query<CodeParams>,
    Connection(connection): Connection,
) -> Result<Outcome, AuthError> {
    let services = &state.services;
    services.realm.check_request(&connection)?;
    AccountLinkingEngine::new(services)
        .after_first_broker_login(&params.code, &params.client_id)
        .await
}

/// GET /broker/after-post-broker-login
pub async fn after_post_broker_login(
    State(state): State<AuthFlowState>,
    Query(params): Query<CodeParams>,
    Connection(connection): Connection,
) -> Result<Outcome, AuthError> {
    let services = &state.services;
    services.realm.check_request(&connection)?;
    AccountLinkingEngine::new(services)
        .after_post_broker_login(&params.code, &params.client_id)
        .await
}
