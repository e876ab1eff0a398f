//! Action token signing and verification.
//!
//! Tokens are compact HS512 JWS values. The signing secret lives in a
//! [`SigningKeyRing`]: the active key signs, every key in the ring verifies,
//! and the JWS `kid` header selects the verification key. Rotation therefore
//! only needs a new active key; tokens issued under the previous one keep
//! verifying until that key is retired.
//!
//! ## Example
//!
//! ```ignore
//! let codec = ActionTokenCodec::new(SigningKeyRing::generate(), issuer, clock);
//!
//! let token = codec
//!     .builder("verify-email", "user-1", Duration::from_secs(300))
//!     .auth_session("session-1")
//!     .note("eml", "user@example.com")
//!     .sign()?;
//!
//! let claims = codec.verify(&token, Some("verify-email"))?;
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::Rng;
use uuid::Uuid;

use super::claims::ActionToken;
use crate::clock::Clock;
use crate::error::AuthError;

/// Upper bound on the encoded token length accepted by the codec.
///
/// Tokens travel in e-mailed links and query strings.
pub const MAX_TOKEN_LENGTH: usize = 4096;

const ALGORITHM: Algorithm = Algorithm::HS512;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while issuing or verifying action tokens.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// The signature did not verify or the token is not a valid JWS.
    #[error("Invalid signature")]
    BadSignature,

    /// The token is past its expiry.
    #[error("Token expired")]
    Expired,

    /// The token carries a different action than the one expected.
    #[error("Action mismatch: expected {expected}, got {actual}")]
    ActionMismatch {
        /// Action id the caller expected.
        expected: String,
        /// Action id embedded in the token.
        actual: String,
    },

    /// The payload is not a well-formed action token.
    #[error("Malformed token: {message}")]
    Malformed {
        /// Description of the structural problem.
        message: String,
    },

    /// The `kid` header names a key that is not in the ring.
    #[error("Unknown signing key: {kid}")]
    UnknownKey {
        /// The key id from the token header.
        kid: String,
    },

    /// Failed to encode a token.
    #[error("Failed to encode token: {message}")]
    Encoding {
        /// Description of the encoding error.
        message: String,
    },
}

impl TokenError {
    /// Creates a new `Malformed` error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Creates a new `Encoding` error.
    #[must_use]
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::Json(_) | ErrorKind::MissingRequiredClaim(_) => {
                Self::malformed(err.to_string())
            }
            _ => Self::BadSignature,
        }
    }
}

impl From<TokenError> for AuthError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => Self::Expired,
            TokenError::ActionMismatch { expected, actual } => {
                Self::ActionMismatch { expected, actual }
            }
            TokenError::Encoding { message } => Self::Internal { message },
            TokenError::BadSignature
            | TokenError::Malformed { .. }
            | TokenError::UnknownKey { .. } => Self::BadSignature,
        }
    }
}

// ============================================================================
// Signing Keys
// ============================================================================

/// HMAC secret addressed by a key id.
#[derive(Clone)]
pub struct SigningKey {
    kid: String,
    secret: Vec<u8>,
}

impl SigningKey {
    /// Creates a key from raw secret bytes.
    #[must_use]
    pub fn new(kid: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            kid: kid.into(),
            secret: secret.into(),
        }
    }

    /// Creates a key from a base64url-encoded secret.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Malformed` if the secret is not valid base64url.
    pub fn from_base64(kid: impl Into<String>, encoded: &str) -> Result<Self, TokenError> {
        let secret = URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map_err(|e| TokenError::malformed(format!("invalid key secret: {e}")))?;
        Ok(Self::new(kid, secret))
    }

    /// Generates a random 512-bit key with a random key id.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut secret = [0u8; 64];
        rng.fill(&mut secret[..]);
        let kid: [u8; 8] = rng.r#gen();
        Self::new(hex::encode(kid), secret.to_vec())
    }

    /// Returns the key id.
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    fn encoding_key(&self) -> EncodingKey {
        EncodingKey::from_secret(&self.secret)
    }

    fn decoding_key(&self) -> DecodingKey {
        DecodingKey::from_secret(&self.secret)
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Set of verification keys with one active signing key.
#[derive(Debug, Clone)]
pub struct SigningKeyRing {
    active: String,
    keys: HashMap<String, SigningKey>,
}

impl SigningKeyRing {
    /// Creates a ring whose only key is also the active one.
    #[must_use]
    pub fn new(active: SigningKey) -> Self {
        let kid = active.kid.clone();
        let mut keys = HashMap::new();
        keys.insert(kid.clone(), active);
        Self { active: kid, keys }
    }

    /// Creates a ring with a freshly generated key.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(SigningKey::generate())
    }

    /// Adds a verification-only key.
    #[must_use]
    pub fn with_key(mut self, key: SigningKey) -> Self {
        self.keys.insert(key.kid.clone(), key);
        self
    }

    /// Makes `key` the active signing key, keeping previous keys for verification.
    pub fn rotate(&mut self, key: SigningKey) {
        self.active = key.kid.clone();
        self.keys.insert(key.kid.clone(), key);
    }

    /// Removes a verification key. The active key cannot be retired.
    pub fn retire(&mut self, kid: &str) -> bool {
        if kid == self.active {
            return false;
        }
        self.keys.remove(kid).is_some()
    }

    /// Returns the active signing key.
    #[must_use]
    pub fn active(&self) -> &SigningKey {
        // The active kid is always present: `new` and `rotate` insert it and
        // `retire` refuses to remove it.
        &self.keys[&self.active]
    }

    /// Looks up a key by id.
    #[must_use]
    pub fn get(&self, kid: &str) -> Option<&SigningKey> {
        self.keys.get(kid)
    }

    /// Returns the number of keys in the ring.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if the ring holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Issues and verifies action tokens.
///
/// Safe to share across tasks; key rotation swaps the ring atomically.
pub struct ActionTokenCodec {
    keys: ArcSwap<SigningKeyRing>,
    issuer: String,
    clock: Arc<dyn Clock>,
}

impl ActionTokenCodec {
    /// Creates a codec.
    ///
    /// # Arguments
    /// * `keys` - Signing and verification keys
    /// * `issuer` - Value of the `iss` and `aud` claims (the realm URL)
    /// * `clock` - Time source for `iat` and expiry checks
    #[must_use]
    pub fn new(keys: SigningKeyRing, issuer: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            keys: ArcSwap::from_pointee(keys),
            issuer: issuer.into(),
            clock,
        }
    }

    /// Returns the issuer URL.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Returns the id of the key currently used for signing.
    #[must_use]
    pub fn active_kid(&self) -> String {
        self.keys.load().active().kid.clone()
    }

    /// Makes `key` the active signing key. Older keys keep verifying.
    pub fn rotate(&self, key: SigningKey) {
        let mut ring = SigningKeyRing::clone(&self.keys.load());
        ring.rotate(key);
        self.keys.store(Arc::new(ring));
    }

    /// Drops a verification key at the end of its grace period.
    pub fn retire_key(&self, kid: &str) -> bool {
        let mut ring = SigningKeyRing::clone(&self.keys.load());
        let removed = ring.retire(kid);
        if removed {
            self.keys.store(Arc::new(ring));
        }
        removed
    }

    /// Starts building a token for `action_id` targeting `user_id`.
    #[must_use]
    pub fn builder(
        &self,
        action_id: impl Into<String>,
        user_id: impl Into<String>,
        ttl: Duration,
    ) -> ActionTokenBuilder<'_> {
        let now = self.clock.unix_timestamp();
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        ActionTokenBuilder {
            codec: self,
            kid: None,
            token: ActionToken {
                jti: Uuid::new_v4().to_string(),
                typ: action_id.into(),
                sub: user_id.into(),
                iat: now,
                exp: now.saturating_add(ttl),
                iss: self.issuer.clone(),
                aud: self.issuer.clone(),
                azp: None,
                asid: None,
                notes: BTreeMap::new(),
            },
        }
    }

    /// Issues a plain token for `action_id` and `user_id`.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn issue(
        &self,
        action_id: impl Into<String>,
        user_id: impl Into<String>,
        ttl: Duration,
    ) -> Result<String, TokenError> {
        self.builder(action_id, user_id, ttl).sign()
    }

    /// Signs prepared claims with the active key.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn encode(&self, token: &ActionToken) -> Result<String, TokenError> {
        let ring = self.keys.load();
        Self::sign_with(ring.active(), token)
    }

    /// Signs prepared claims with a specific key from the ring.
    ///
    /// # Errors
    /// Returns `TokenError::UnknownKey` if `kid` is not in the ring.
    pub fn encode_with_key(&self, token: &ActionToken, kid: &str) -> Result<String, TokenError> {
        let ring = self.keys.load();
        let key = ring.get(kid).ok_or_else(|| TokenError::UnknownKey {
            kid: kid.to_string(),
        })?;
        Self::sign_with(key, token)
    }

    fn sign_with(key: &SigningKey, token: &ActionToken) -> Result<String, TokenError> {
        let mut header = Header::new(ALGORITHM);
        header.kid = Some(key.kid.clone());

        encode(&header, token, &key.encoding_key()).map_err(|e| TokenError::encoding(e.to_string()))
    }

    /// Decodes the claims without verifying anything.
    ///
    /// Only used to resolve the handler before full verification; nothing
    /// read here may be trusted.
    ///
    /// # Errors
    /// Returns `TokenError::Malformed` if the token is not a decodable JWS.
    pub fn peek(&self, token: &str) -> Result<ActionToken, TokenError> {
        if token.len() > MAX_TOKEN_LENGTH {
            return Err(TokenError::malformed("token too long"));
        }
        let mut parts = token.split('.');
        let (Some(_), Some(payload), Some(_), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::malformed("expected three segments"));
        };
        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| TokenError::malformed(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| TokenError::malformed(e.to_string()))
    }

    /// Fully verifies a token.
    ///
    /// Checks run in order: signature, expiry, issuer, audience, and finally
    /// the action id when `expected_action` is given.
    ///
    /// # Errors
    /// Returns the first failing check as a [`TokenError`].
    pub fn verify(
        &self,
        token: &str,
        expected_action: Option<&str>,
    ) -> Result<ActionToken, TokenError> {
        if token.len() > MAX_TOKEN_LENGTH {
            return Err(TokenError::malformed("token too long"));
        }

        let header = jsonwebtoken::decode_header(token).map_err(|_| TokenError::BadSignature)?;
        let ring = self.keys.load();
        let key = match header.kid.as_deref() {
            Some(kid) => ring.get(kid).ok_or_else(|| TokenError::UnknownKey {
                kid: kid.to_string(),
            })?,
            None => ring.active(),
        };

        let mut validation = Validation::new(ALGORITHM);
        validation.required_spec_claims = HashSet::new();
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;

        let claims = decode::<ActionToken>(token, &key.decoding_key(), &validation)?.claims;

        if self.clock.unix_timestamp() > claims.exp {
            return Err(TokenError::Expired);
        }
        if claims.iss != self.issuer {
            return Err(TokenError::malformed("issuer mismatch"));
        }
        if claims.aud != self.issuer {
            return Err(TokenError::malformed("audience mismatch"));
        }
        if claims.jti.is_empty() {
            return Err(TokenError::malformed("nonce not present"));
        }
        if let Some(expected) = expected_action {
            if claims.typ != expected {
                return Err(TokenError::ActionMismatch {
                    expected: expected.to_string(),
                    actual: claims.typ,
                });
            }
        }

        Ok(claims)
    }
}

/// Builder for action tokens, obtained from [`ActionTokenCodec::builder`].
pub struct ActionTokenBuilder<'a> {
    codec: &'a ActionTokenCodec,
    kid: Option<String>,
    token: ActionToken,
}

impl ActionTokenBuilder<'_> {
    /// Binds the token to an auth session.
    #[must_use]
    pub fn auth_session(mut self, id: impl Into<String>) -> Self {
        self.token.asid = Some(id.into());
        self
    }

    /// Records the client the token is issued for.
    #[must_use]
    pub fn issued_for(mut self, client_id: impl Into<String>) -> Self {
        self.token.azp = Some(client_id.into());
        self
    }

    /// Adds a handler-specific claim.
    #[must_use]
    pub fn note(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.token.notes.insert(name.into(), value.into());
        self
    }

    /// Signs with a specific key instead of the active one.
    #[must_use]
    pub fn key_id(mut self, kid: impl Into<String>) -> Self {
        self.kid = Some(kid.into());
        self
    }

    /// Returns the claims without signing.
    #[must_use]
    pub fn build(self) -> ActionToken {
        self.token
    }

    /// Signs the token.
    ///
    /// # Errors
    /// Returns an error if encoding fails or the requested key is unknown.
    pub fn sign(self) -> Result<String, TokenError> {
        match self.kid.as_deref() {
            Some(kid) => self.codec.encode_with_key(&self.token, kid),
            None => self.codec.encode(&self.token),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
