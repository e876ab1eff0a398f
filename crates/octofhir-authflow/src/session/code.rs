//! Short-lived session codes.
//!
//! A session code is `<sessionId>.<secret>`. It travels in redirects between
//! flow steps (broker state, after-broker-login callbacks) and identifies the
//! auth session without relying on the cookie. Issuing a code replaces the
//! previous one, so only the latest redirect is honored.

use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use super::model::AuthSession;
use super::notes::CoreNote;
use crate::AuthResult;
use crate::error::AuthError;

/// Parsed session code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCode<'a> {
    /// Id of the auth session the code belongs to.
    pub session_id: &'a str,
    secret: &'a str,
}

impl<'a> SessionCode<'a> {
    /// Splits a code into session id and secret.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidCode` if the code is not `<id>.<secret>`.
    pub fn parse(code: &'a str) -> AuthResult<Self> {
        match code.rsplit_once('.') {
            Some((session_id, secret)) if !session_id.is_empty() && !secret.is_empty() => {
                Ok(Self { session_id, secret })
            }
            _ => Err(AuthError::invalid_code("malformed session code")),
        }
    }

    /// Checks the code against the one last issued for `session`.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidCode` if the code belongs to another
    /// session or was replaced, and `AuthError::Expired` if it is older than
    /// `lifespan`.
    pub fn verify(
        &self,
        session: &AuthSession,
        now: OffsetDateTime,
        lifespan: Duration,
    ) -> AuthResult<()> {
        if self.session_id != session.id {
            return Err(AuthError::invalid_code("session code for another session"));
        }
        let Some(expected) = session.core_note(CoreNote::SessionCode) else {
            return Err(AuthError::invalid_code("no session code issued"));
        };
        if !bool::from(expected.as_bytes().ct_eq(self.secret.as_bytes())) {
            return Err(AuthError::invalid_code("stale session code"));
        }

        let issued_at = session
            .core_note(CoreNote::SessionCodeIssuedAt)
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or_else(|| AuthError::invalid_code("session code without timestamp"))?;
        let lifespan = i64::try_from(lifespan.as_secs()).unwrap_or(i64::MAX);
        if now.unix_timestamp() > issued_at.saturating_add(lifespan) {
            return Err(AuthError::Expired);
        }
        Ok(())
    }
}

/// Issues a new code for `session`, invalidating the previous one.
#[must_use]
pub fn issue_code(session: &mut AuthSession, now: OffsetDateTime) -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill(&mut bytes);
    let secret = URL_SAFE_NO_PAD.encode(bytes);

    session.set_core_note(CoreNote::SessionCode, secret.clone());
    session.set_core_note(CoreNote::SessionCodeIssuedAt, now.unix_timestamp().to_string());
    format!("{}.{secret}", session.id)
}
