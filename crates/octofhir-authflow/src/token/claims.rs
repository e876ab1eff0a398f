//! Action token claims.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Claims carried by an action token.
///
/// Handler-specific values (the email being verified, the provider alias of
/// a pending link, the list of required actions) travel as string `notes`
/// flattened into the claim set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionToken {
    /// Unique token id. Also used as the single-use nonce.
    pub jti: String,

    /// Action identifier.
    pub typ: String,

    /// Target user id.
    pub sub: String,

    /// Issued at (Unix timestamp).
    pub iat: i64,

    /// Expiration time (Unix timestamp).
    pub exp: i64,

    /// Issuer (realm URL).
    pub iss: String,

    /// Audience (realm URL).
    pub aud: String,

    /// Client the token was issued for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,

    /// Auth session the token is bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asid: Option<String>,

    /// Handler-specific claims.
    #[serde(flatten)]
    pub notes: BTreeMap<String, String>,
}

impl ActionToken {
    /// Returns the action identifier.
    #[must_use]
    pub fn action_id(&self) -> &str {
        &self.typ
    }

    /// Returns the target user id.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.sub
    }

    /// Returns the bound auth session id, if any.
    #[must_use]
    pub fn auth_session_id(&self) -> Option<&str> {
        self.asid.as_deref()
    }

    /// Returns a handler note.
    #[must_use]
    pub fn note(&self, name: &str) -> Option<&str> {
        self.notes.get(name).map(String::as_str)
    }

    /// Key recorded in the consumed-token marker: `userId.exp.tokenId`.
    #[must_use]
    pub fn serialized_key(&self) -> String {
        format!("{}.{}.{}", self.sub, self.exp, self.jti)
    }
}
