//! Authentication flow configuration.
//!
//! Configuration for the realm, action token signing, auth sessions,
//! client-initiated linking, and the clients and identity providers the
//! flows may reference.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::token::{SigningKey, SigningKeyRing};

/// Root configuration.
///
/// # Example (TOML)
///
/// ```toml
/// [authflow.realm]
/// name = "main"
/// public_url = "https://id.example.com"
/// ssl_required = "external"
///
/// [authflow.action_tokens]
/// default_lifespan = "5m"
/// keys = [{ kid = "2024-01", secret = "c2VjcmV0..." }]
///
/// [[authflow.identity_providers]]
/// alias = "github"
/// store_token = true
/// post_broker_login_flow = "otp"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthFlowConfig {
    /// Realm-wide settings.
    pub realm: RealmConfig,

    /// Action token signing and lifespans.
    pub action_tokens: ActionTokenConfig,

    /// Auth session and session code settings.
    pub sessions: SessionConfig,

    /// Client-initiated account linking.
    pub linking: LinkingConfig,

    /// Registered clients.
    pub clients: Vec<ClientConfig>,

    /// Federated identity providers.
    pub identity_providers: Vec<IdentityProviderConfig>,
}

/// Realm settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RealmConfig {
    /// Realm name, part of the issuer URL.
    pub name: String,

    /// Disabled realms reject every flow.
    pub enabled: bool,

    /// Which requests must use TLS.
    pub ssl_required: SslRequired,

    /// Use the e-mail address as username for brokered registrations.
    pub registration_email_as_username: bool,

    /// Consult the brute-force protector before completing broker logins.
    pub brute_force_protected: bool,

    /// Public base URL of the server.
    pub public_url: String,

    /// Client id of the account console.
    pub account_client_id: String,

    /// Flow used for plain browser logins and restarts.
    pub browser_flow: String,
}

impl Default for RealmConfig {
    fn default() -> Self {
        Self {
            name: "main".to_string(),
            enabled: true,
            ssl_required: SslRequired::External,
            registration_email_as_username: false,
            brute_force_protected: false,
            public_url: "http://localhost:8080".to_string(),
            account_client_id: "account".to_string(),
            browser_flow: "browser".to_string(),
        }
    }
}

/// TLS requirement for incoming requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SslRequired {
    /// Every request must use TLS.
    All,
    /// Requests from non-local addresses must use TLS.
    External,
    /// TLS is never required.
    None,
}

/// Action token configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ActionTokenConfig {
    /// Issuer and audience of action tokens.
    /// Defaults to `{public_url}/realms/{realm}`.
    pub issuer: Option<String>,

    /// HMAC keys (base64url secrets). A random key is generated when empty.
    pub keys: Vec<SigningKeyConfig>,

    /// Key used for signing. Defaults to the first configured key.
    pub active_kid: Option<String>,

    /// Lifespan of tokens whose action has no explicit entry.
    #[serde(with = "humantime_serde")]
    pub default_lifespan: Duration,

    /// Per-action lifespans keyed by action id.
    pub lifespans: HashMap<String, humantime_serde::Serde<Duration>>,
}

impl Default for ActionTokenConfig {
    fn default() -> Self {
        Self {
            issuer: None,
            keys: Vec::new(),
            active_kid: None,
            default_lifespan: Duration::from_secs(300), // 5 minutes
            lifespans: HashMap::new(),
        }
    }
}

/// A configured signing key.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SigningKeyConfig {
    /// Key id placed in the token header.
    pub kid: String,
    /// Base64url-encoded secret.
    pub secret: String,
}

impl ActionTokenConfig {
    /// Returns the lifespan for tokens of `action_id`.
    #[must_use]
    pub fn lifespan_for(&self, action_id: &str) -> Duration {
        self.lifespans
            .get(action_id)
            .map(|d| **d)
            .unwrap_or(self.default_lifespan)
    }

    /// Builds the signing key ring, generating a key when none is configured.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a secret is not valid base64url
    /// or the active key id is unknown.
    pub fn key_ring(&self) -> Result<SigningKeyRing, ConfigError> {
        let mut keys = Vec::with_capacity(self.keys.len());
        for key in &self.keys {
            let key = SigningKey::from_base64(&key.kid, &key.secret)
                .map_err(|e| ConfigError::InvalidValue(format!("key '{}': {e}", key.kid)))?;
            keys.push(key);
        }

        let Some(first) = keys.first() else {
            tracing::warn!("No action token keys configured, generating an ephemeral key");
            return Ok(SigningKeyRing::generate());
        };

        let active_kid = self
            .active_kid
            .clone()
            .unwrap_or_else(|| first.kid().to_string());
        let active = keys
            .iter()
            .find(|k| k.kid() == active_kid)
            .cloned()
            .ok_or_else(|| {
                ConfigError::InvalidValue(format!("active_kid '{active_kid}' is not configured"))
            })?;

        Ok(keys
            .into_iter()
            .fold(SigningKeyRing::new(active), SigningKeyRing::with_key))
    }
}

/// Auth session configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle lifetime of an auth session before it is swept.
    #[serde(with = "humantime_serde")]
    pub auth_session_lifespan: Duration,

    /// Lifetime of a session code.
    #[serde(with = "humantime_serde")]
    pub code_lifespan: Duration,

    /// Cookie carrying the auth session id.
    pub auth_session_cookie: String,

    /// Cookie carrying the logged-in user session id.
    pub identity_cookie: String,

    /// Mark cookies `Secure`.
    pub secure_cookies: bool,

    /// Take TLS and client address from `X-Forwarded-Proto` and
    /// `X-Forwarded-For`. Disable unless a reverse proxy sets them.
    pub trust_proxy_headers: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth_session_lifespan: Duration::from_secs(1800), // 30 minutes
            code_lifespan: Duration::from_secs(300),          // 5 minutes
            auth_session_cookie: "AUTH_SESSION_ID".to_string(),
            identity_cookie: "AUTHFLOW_IDENTITY".to_string(),
            secure_cookies: false,
            trust_proxy_headers: true,
        }
    }
}

/// Client-initiated linking configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LinkingConfig {
    /// Query parameter carrying the rejection code back to the application.
    pub error_param: String,
}

impl Default for LinkingConfig {
    fn default() -> Self {
        Self {
            error_param: "link_error".to_string(),
        }
    }
}

/// A registered client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Public client identifier.
    pub client_id: String,

    /// Disabled clients cannot start or resume flows.
    pub enabled: bool,

    /// Allowed redirect URIs. A trailing `*` matches any suffix.
    pub redirect_uris: Vec<String>,

    /// Landing page used when no redirect URI is known.
    pub base_url: Option<String>,

    /// Login protocol.
    pub protocol: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            enabled: true,
            redirect_uris: Vec::new(),
            base_url: None,
            protocol: "openid-connect".to_string(),
        }
    }
}

/// A federated identity provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdentityProviderConfig {
    /// Provider alias used in URLs and links.
    pub alias: String,

    /// Disabled providers cannot be used to log in or link.
    pub enabled: bool,

    /// Persist the provider token on the federated identity link.
    pub store_token: bool,

    /// Provider may only be used for linking, never to log in.
    pub link_only: bool,

    /// Treat e-mail addresses asserted by the provider as verified.
    pub trust_email: bool,

    /// Grant the broker read-token role to users registered through this provider.
    pub add_read_token_role_on_create: bool,

    /// Flow run when the external identity has no local user yet.
    pub first_broker_login_flow: Option<String>,

    /// Flow run after every login through this provider.
    pub post_broker_login_flow: Option<String>,

    /// Authorization endpoint of the external provider.
    pub authorization_url: Option<String>,

    /// Client id registered at the external provider.
    pub client_id: Option<String>,
}

impl Default for IdentityProviderConfig {
    fn default() -> Self {
        Self {
            alias: String::new(),
            enabled: true,
            store_token: false,
            link_only: false,
            trust_email: false,
            add_read_token_role_on_create: false,
            first_broker_login_flow: Some("first broker login".to_string()),
            post_broker_login_flow: None,
            authorization_url: None,
            client_id: None,
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An invalid configuration value was provided.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// A required configuration value is missing.
    #[error("Missing required configuration: {0}")]
    Missing(String),
}

impl AuthFlowConfig {
    /// Returns the issuer of action tokens.
    #[must_use]
    pub fn issuer(&self) -> String {
        self.action_tokens.issuer.clone().unwrap_or_else(|| {
            format!(
                "{}/realms/{}",
                self.realm.public_url.trim_end_matches('/'),
                self.realm.name
            )
        })
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if:
    /// - The realm name is empty or the public URL does not parse
    /// - A lifespan is zero
    /// - A signing key is invalid or the active key id is unknown
    /// - Client ids or provider aliases are empty or duplicated
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.realm.name.is_empty() {
            return Err(ConfigError::Missing("realm.name".to_string()));
        }

        url::Url::parse(&self.realm.public_url).map_err(|e| {
            ConfigError::InvalidValue(format!(
                "realm.public_url '{}' is not a valid URL: {e}",
                self.realm.public_url
            ))
        })?;

        if self.action_tokens.default_lifespan.is_zero() {
            return Err(ConfigError::InvalidValue(
                "action_tokens.default_lifespan must be greater than zero".to_string(),
            ));
        }
        if self.sessions.code_lifespan.is_zero() || self.sessions.auth_session_lifespan.is_zero()
        {
            return Err(ConfigError::InvalidValue(
                "session lifespans must be greater than zero".to_string(),
            ));
        }

        self.action_tokens.key_ring()?;

        if self.linking.error_param.is_empty() {
            return Err(ConfigError::InvalidValue(
                "linking.error_param cannot be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for client in &self.clients {
            if client.client_id.is_empty() {
                return Err(ConfigError::Missing("clients[].client_id".to_string()));
            }
            if !seen.insert(client.client_id.as_str()) {
                return Err(ConfigError::InvalidValue(format!(
                    "duplicate client id '{}'",
                    client.client_id
                )));
            }
        }

        let mut seen = HashSet::new();
        for idp in &self.identity_providers {
            if idp.alias.is_empty() {
                return Err(ConfigError::Missing("identity_providers[].alias".to_string()));
            }
            if !seen.insert(idp.alias.as_str()) {
                return Err(ConfigError::InvalidValue(format!(
                    "duplicate identity provider alias '{}'",
                    idp.alias
                )));
            }
        }

        Ok(())
    }
}
