//! Client-initiated account linking.
//!
//! An application asks to link the logged-in user to a provider by sending
//! the browser to `broker/{provider}/link` with a nonce and a hash:
//!
//! ```text
//! hash = base64url(SHA-256(nonce || user_session_id || client_id || provider_alias))
//! ```
//!
//! Only the application holding the user session id can compute the hash,
//! so a forged link cannot start a linking round trip. Rejections the
//! application can act on are reported back to its redirect URI; malformed
//! requests fail outright.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use url::Url;

use crate::AuthResult;
use crate::broker::AccountLinkingEngine;
use crate::error::AuthError;
use crate::events::{AuthEvent, EventType, details};
use crate::outcome::Outcome;
use crate::realm::{ConnectionInfo, origin_of};
use crate::services::AuthFlowServices;
use crate::session::{AuthSession, LinkingIntent, STATE_NOTE};
use crate::store::{MANAGE_ACCOUNT_LINKS_ROLE, MANAGE_ACCOUNT_ROLE, UserSession};
use crate::urls::with_query;

// ============================================================================
// Hash
// ============================================================================

/// Computes the link hash an application sends along with `nonce`.
#[must_use]
pub fn compute_link_hash(
    nonce: &str,
    user_session_id: &str,
    client_id: &str,
    provider_alias: &str,
) -> String {
    URL_SAFE_NO_PAD.encode(link_digest(nonce, user_session_id, client_id, provider_alias))
}

/// Checks `hash` against the expected digest in constant time.
///
/// # Errors
///
/// Returns `AuthError::InvalidHandshake` if the hash does not decode or does
/// not match.
pub fn verify_link_hash(
    hash: &str,
    nonce: &str,
    user_session_id: &str,
    client_id: &str,
    provider_alias: &str,
) -> AuthResult<()> {
    let provided = URL_SAFE_NO_PAD
        .decode(hash.trim_end_matches('='))
        .map_err(|_| AuthError::invalid_handshake("link hash is not base64url"))?;
    let expected = link_digest(nonce, user_session_id, client_id, provider_alias);
    if bool::from(provided.as_slice().ct_eq(expected.as_slice())) {
        Ok(())
    } else {
        Err(AuthError::invalid_handshake("link hash mismatch"))
    }
}

fn link_digest(nonce: &str, user_session_id: &str, client_id: &str, provider_alias: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(nonce.as_bytes());
    hasher.update(user_session_id.as_bytes());
    hasher.update(client_id.as_bytes());
    hasher.update(provider_alias.as_bytes());
    hasher.finalize().to_vec()
}

// ============================================================================
// Handshake
// ============================================================================

/// A link request as received from the browser.
#[derive(Debug, Clone, Default)]
pub struct LinkRequest {
    pub provider_alias: String,
    pub redirect_uri: String,
    pub client_id: String,
    pub nonce: Option<String>,
    pub hash: Option<String>,
    /// User session id from the identity cookie.
    pub user_session_id: Option<String>,
    pub connection: ConnectionInfo,
}

/// Reason a link request was handed back to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRejection {
    NotLoggedIn,
    InvalidToken,
    NotAllowed,
    UnknownIdentityProvider,
}

impl LinkRejection {
    /// Code sent to the application.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotLoggedIn => "not_logged_in",
            Self::InvalidToken => "invalid_token",
            Self::NotAllowed => "not_allowed",
            Self::UnknownIdentityProvider => "unknown_identity_provider",
        }
    }
}

impl std::fmt::Display for LinkRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a link request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkInitiation {
    /// A linking session was started; the browser goes to the provider.
    Started {
        /// New auth session, addressed by the auth-session cookie.
        session_id: String,
        outcome: Outcome,
    },
    /// The request was handed back to the application.
    Rejected {
        reason: LinkRejection,
        redirect: Url,
    },
}

/// Validates link requests and starts linking sessions.
pub struct ClientInitiatedLinking<'a> {
    services: &'a AuthFlowServices,
}

impl<'a> ClientInitiatedLinking<'a> {
    #[must_use]
    pub fn new(services: &'a AuthFlowServices) -> Self {
        Self { services }
    }

    /// Handles a link request.
    ///
    /// # Errors
    ///
    /// - `RealmDisabled` / `TlsRequired` from the realm checks
    /// - `InvalidRequest` for an unknown client, an unregistered redirect
    ///   URI, a missing nonce or hash, or a foreign `Origin`
    /// - `IdentityProvider` if the provider has no implementation
    pub async fn initiate(&self, request: LinkRequest) -> AuthResult<LinkInitiation> {
        let services = self.services;
        let realm = &services.realm;
        let mut event = AuthEvent::new(EventType::ClientInitiatedAccountLinking);
        event
            .realm(&realm.name)
            .client(&request.client_id)
            .detail(details::IDENTITY_PROVIDER, request.provider_alias.as_str())
            .detail(details::REDIRECT_URI, request.redirect_uri.as_str());

        realm.check_request(&request.connection)?;

        let client = realm
            .enabled_client(&request.client_id)
            .map_err(|_| AuthError::invalid_request("unknown or disabled client"))?;
        let Some(redirect) = client.verify_redirect_uri(Some(&request.redirect_uri)) else {
            event.error("invalid_redirect_uri");
            return Err(AuthError::invalid_request("invalid redirect uri"));
        };
        let (Some(nonce), Some(hash)) = (request.nonce.as_deref(), request.hash.as_deref()) else {
            event.error("invalid_request");
            return Err(AuthError::invalid_request("nonce and hash are required"));
        };
        if let Some(origin) = &request.connection.origin {
            if *origin != origin_of(&redirect) {
                event.error("invalid_request");
                return Err(AuthError::invalid_request("origin does not match redirect uri"));
            }
        }

        let reject = |reason: LinkRejection| -> AuthResult<LinkInitiation> {
            event.error(reason.as_str());
            tracing::debug!(
                client_id = %request.client_id,
                provider = %request.provider_alias,
                reason = %reason,
                "Client-initiated linking rejected"
            );
            let url = with_query(
                redirect.clone(),
                &[
                    (services.config.linking.error_param.as_str(), reason.as_str()),
                    ("nonce", nonce),
                ],
            );
            Ok(LinkInitiation::Rejected {
                reason,
                redirect: url,
            })
        };

        let user_session = match &request.user_session_id {
            Some(id) => services.user_sessions.get(id).await?,
            None => None,
        };
        let Some(user_session) = user_session else {
            return reject(LinkRejection::NotLoggedIn);
        };
        let Some(client_session) = user_session.client_session(&request.client_id) else {
            return reject(LinkRejection::NotLoggedIn);
        };

        if verify_link_hash(
            hash,
            nonce,
            &user_session.id,
            &request.client_id,
            &request.provider_alias,
        )
        .is_err()
        {
            return reject(LinkRejection::InvalidToken);
        }

        let allowed = realm.is_account_console(&request.client_id)
            || client_session.has_role(MANAGE_ACCOUNT_ROLE)
            || client_session.has_role(MANAGE_ACCOUNT_LINKS_ROLE);
        if !allowed {
            return reject(LinkRejection::NotAllowed);
        }

        if realm
            .identity_provider(&request.provider_alias)
            .is_none_or(|p| !p.enabled)
        {
            return reject(LinkRejection::UnknownIdentityProvider);
        }

        event.user(&user_session.user_id).session(&user_session.id);
        let outcome = self
            .start_linking_session(&user_session, &request.client_id, &request.provider_alias, &redirect)
            .await?;
        event.success();
        Ok(LinkInitiation::Started {
            session_id: user_session.id,
            outcome,
        })
    }

    async fn start_linking_session(
        &self,
        user_session: &UserSession,
        client_id: &str,
        provider_alias: &str,
        redirect: &Url,
    ) -> AuthResult<Outcome> {
        let services = self.services;
        let _lock = services.sessions.lock(&user_session.id).await;

        let mut session = AuthSession::new(&user_session.id, client_id, services.clock.now());
        if let Some(client) = services.realm.client(client_id) {
            session.protocol = client.protocol.clone();
        }
        session.redirect_uri = Some(redirect.to_string());
        session.set_client_note(STATE_NOTE, random_state());
        session.set_linking_intent(&LinkingIntent::new(
            &user_session.id,
            client_id,
            provider_alias,
        ))?;
        services.sessions.create(&session).await?;

        tracing::info!(
            user_id = %user_session.user_id,
            client_id = %client_id,
            provider = %provider_alias,
            "Starting client-initiated account linking"
        );
        let session_id = session.id.clone();
        let result = AccountLinkingEngine::new(services)
            .redirect_to_provider(session, provider_alias)
            .await;
        if let Err(error) = &result {
            tracing::warn!(
                session_id = %session_id,
                error = %error,
                "Linking redirect failed, dropping session"
            );
            if let Err(e) = services.sessions.remove(&session_id).await {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to remove auth session");
            }
        }
        result
    }
}

fn random_state() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
