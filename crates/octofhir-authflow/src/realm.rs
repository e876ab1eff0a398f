//! Realm directory.
//!
//! The realm, its clients and its identity providers, resolved from
//! configuration once at startup.

use std::collections::HashMap;
use std::net::IpAddr;

use url::Url;

use crate::AuthResult;
use crate::config::{AuthFlowConfig, ClientConfig, IdentityProviderConfig, SslRequired};
use crate::error::AuthError;

/// Properties of the incoming connection the flows care about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Request arrived over TLS (directly or via a trusted proxy).
    pub secure: bool,
    /// Peer address, when known.
    pub remote_addr: Option<IpAddr>,
    /// `Origin` request header.
    pub origin: Option<String>,
}

impl ConnectionInfo {
    /// A TLS connection from an unknown peer.
    #[must_use]
    pub fn secure() -> Self {
        Self {
            secure: true,
            ..Default::default()
        }
    }
}

impl SslRequired {
    /// Returns `true` if a request from `addr` must use TLS.
    ///
    /// `External` exempts loopback, private and link-local addresses. An
    /// unknown address is treated as external.
    #[must_use]
    pub fn is_required(&self, addr: Option<IpAddr>) -> bool {
        match self {
            Self::All => true,
            Self::None => false,
            Self::External => !addr.is_some_and(is_local_address),
        }
    }
}

fn is_local_address(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_local_address(IpAddr::V4(v4));
            }
            // fc00::/7 unique local, fe80::/10 link-local
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Returns the origin (`scheme://host[:port]`) of `uri`.
#[must_use]
pub fn origin_of(uri: &Url) -> String {
    uri.origin().ascii_serialization()
}

/// A registered client.
#[derive(Debug, Clone)]
pub struct Client {
    pub client_id: String,
    pub enabled: bool,
    pub redirect_uris: Vec<String>,
    pub base_url: Option<String>,
    pub protocol: String,
}

impl Client {
    fn from_config(config: &ClientConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            enabled: config.enabled,
            redirect_uris: config.redirect_uris.clone(),
            base_url: config.base_url.clone(),
            protocol: config.protocol.clone(),
        }
    }

    /// Checks `redirect_uri` against the registered redirect URIs.
    ///
    /// An entry matches exactly, or as a prefix when it ends with `*`.
    /// Without an explicit URI the single registered URI (if it has no
    /// wildcard) or the base URL is used.
    #[must_use]
    pub fn verify_redirect_uri(&self, redirect_uri: Option<&str>) -> Option<Url> {
        let Some(requested) = redirect_uri.filter(|u| !u.is_empty()) else {
            let fallback = match self.redirect_uris.as_slice() {
                [only] if !only.ends_with('*') => Some(only.as_str()),
                _ => self.base_url.as_deref(),
            };
            return fallback.and_then(|u| Url::parse(u).ok());
        };

        let parsed = Url::parse(requested).ok()?;
        // Fragments are never allowed in redirect URIs.
        if parsed.fragment().is_some() {
            return None;
        }

        let matches = self.redirect_uris.iter().any(|allowed| {
            match allowed.strip_suffix('*') {
                Some(prefix) => requested.starts_with(prefix),
                None => allowed == requested,
            }
        });
        matches.then_some(parsed)
    }

    /// Returns the landing page of the client.
    #[must_use]
    pub fn base_url(&self) -> Option<Url> {
        self.base_url.as_deref().and_then(|u| Url::parse(u).ok())
    }
}

/// Realm model.
#[derive(Debug, Clone)]
pub struct Realm {
    pub name: String,
    pub enabled: bool,
    pub ssl_required: SslRequired,
    pub registration_email_as_username: bool,
    pub brute_force_protected: bool,
    pub account_client_id: String,
    pub browser_flow: String,
    pub public_url: Url,
    clients: HashMap<String, Client>,
    identity_providers: HashMap<String, IdentityProviderConfig>,
}

impl Realm {
    /// Builds the realm from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Configuration` if the public URL does not parse.
    pub fn from_config(config: &AuthFlowConfig) -> AuthResult<Self> {
        let public_url = Url::parse(&config.realm.public_url).map_err(|e| {
            AuthError::configuration(format!("invalid public_url: {e}"))
        })?;

        Ok(Self {
            name: config.realm.name.clone(),
            enabled: config.realm.enabled,
            ssl_required: config.realm.ssl_required,
            registration_email_as_username: config.realm.registration_email_as_username,
            brute_force_protected: config.realm.brute_force_protected,
            account_client_id: config.realm.account_client_id.clone(),
            browser_flow: config.realm.browser_flow.clone(),
            public_url,
            clients: config
                .clients
                .iter()
                .map(|c| (c.client_id.clone(), Client::from_config(c)))
                .collect(),
            identity_providers: config
                .identity_providers
                .iter()
                .map(|p| (p.alias.clone(), p.clone()))
                .collect(),
        })
    }

    /// Rejects requests to a disabled realm or plain-HTTP requests the realm
    /// requires to use TLS.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::RealmDisabled` or `AuthError::TlsRequired`.
    pub fn check_request(&self, connection: &ConnectionInfo) -> AuthResult<()> {
        if !self.enabled {
            return Err(AuthError::RealmDisabled);
        }
        if !connection.secure && self.ssl_required.is_required(connection.remote_addr) {
            return Err(AuthError::TlsRequired);
        }
        Ok(())
    }

    #[must_use]
    pub fn client(&self, client_id: &str) -> Option<&Client> {
        self.clients.get(client_id)
    }

    /// Returns an enabled client.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidClient` if the client is unknown or disabled.
    pub fn enabled_client(&self, client_id: &str) -> AuthResult<&Client> {
        match self.clients.get(client_id) {
            Some(client) if client.enabled => Ok(client),
            Some(_) => Err(AuthError::invalid_client(format!(
                "client {client_id} is disabled"
            ))),
            None => Err(AuthError::invalid_client(format!(
                "client {client_id} not found"
            ))),
        }
    }

    /// Returns `true` if `client_id` is the account console.
    #[must_use]
    pub fn is_account_console(&self, client_id: &str) -> bool {
        client_id == self.account_client_id
    }

    #[must_use]
    pub fn identity_provider(&self, alias: &str) -> Option<&IdentityProviderConfig> {
        self.identity_providers.get(alias)
    }

    /// Returns an enabled identity provider.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::IdentityProvider` if the provider is unknown or disabled.
    pub fn enabled_identity_provider(&self, alias: &str) -> AuthResult<&IdentityProviderConfig> {
        match self.identity_providers.get(alias) {
            Some(idp) if idp.enabled => Ok(idp),
            Some(_) => Err(AuthError::identity_provider(alias, "identity provider is disabled")),
            None => Err(AuthError::identity_provider(alias, "identity provider not found")),
        }
    }
}
