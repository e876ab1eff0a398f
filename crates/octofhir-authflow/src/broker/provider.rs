//! External identity provider contract.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use super::context::BrokeredIdentityContext;
use crate::AuthResult;
use crate::session::AuthSession;
use crate::store::User;

/// Result of a provider callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCallback {
    /// The provider asserted an identity.
    Authenticated(BrokeredIdentityContext),
    /// The user cancelled at the provider.
    Cancelled,
    /// The provider reported an error.
    Error(String),
}

/// Parameters of a login redirect to an external provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    /// Auth session the login belongs to.
    pub session_id: String,
    /// Opaque state echoed back by the provider. Holds a session code.
    pub state: String,
    /// Callback endpoint the provider must redirect to.
    pub redirect_uri: Url,
    /// Client the login was started for.
    pub client_id: String,
}

/// An external identity provider.
///
/// Wire protocol details (OIDC, SAML, social APIs) live entirely behind this
/// trait. The mapper hooks default to no-ops.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Alias the provider is configured under.
    fn alias(&self) -> &str;

    /// Builds the redirect to the provider's login page.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::IdentityProvider` if the redirect cannot be built.
    async fn login_redirect(&self, request: &LoginRequest) -> AuthResult<Url>;

    /// Interprets the callback request parameters.
    ///
    /// The `state` parameter has already been consumed by the endpoint.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::IdentityProvider` if the callback is malformed.
    async fn handle_callback(&self, params: &HashMap<String, String>)
    -> AuthResult<BrokerCallback>;

    /// Adjusts the context before any linking decision.
    async fn preprocess(&self, _context: &mut BrokeredIdentityContext) -> AuthResult<()> {
        Ok(())
    }

    /// Called once for a user created from this provider's identity.
    async fn import_new_user(
        &self,
        _user: &mut User,
        _context: &BrokeredIdentityContext,
    ) -> AuthResult<()> {
        Ok(())
    }

    /// Called for an existing user on every login through this provider.
    async fn update_brokered_user(
        &self,
        _user: &mut User,
        _context: &BrokeredIdentityContext,
    ) -> AuthResult<()> {
        Ok(())
    }

    /// Called when authentication or linking through this provider finished.
    async fn authentication_finished(
        &self,
        _session: &mut AuthSession,
        _context: &BrokeredIdentityContext,
    ) -> AuthResult<()> {
        Ok(())
    }
}

/// Identity provider implementations by alias.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn IdentityProvider>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `provider` under its alias, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn IdentityProvider>) {
        self.providers.insert(provider.alias().to_string(), provider);
    }

    #[must_use]
    pub fn with(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.register(provider);
        self
    }

    #[must_use]
    pub fn get(&self, alias: &str) -> Option<Arc<dyn IdentityProvider>> {
        self.providers.get(alias).cloned()
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("aliases", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticProvider;

    #[async_trait]
    impl IdentityProvider for StaticProvider {
        fn alias(&self) -> &str {
            "static"
        }

        async fn login_redirect(&self, request: &LoginRequest) -> AuthResult<Url> {
            let mut url = Url::parse("https://idp.example.com/authorize").unwrap();
            url.query_pairs_mut().append_pair("state", &request.state);
            Ok(url)
        }

        async fn handle_callback(
            &self,
            params: &HashMap<String, String>,
        ) -> AuthResult<BrokerCallback> {
            Ok(match params.get("sub") {
                Some(sub) => BrokerCallback::Authenticated(BrokeredIdentityContext::new(
                    "static",
                    sub.clone(),
                )),
                None => BrokerCallback::Cancelled,
            })
        }
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let registry = ProviderRegistry::new().with(Arc::new(StaticProvider));
        assert!(registry.get("missing").is_none());

        let provider = registry.get("static").unwrap();
        let params = HashMap::from([("sub".to_string(), "42".to_string())]);
        match provider.handle_callback(&params).await.unwrap() {
            BrokerCallback::Authenticated(ctx) => assert_eq!(ctx.id, "42"),
            other => panic!("unexpected callback {other:?}"),
        }
        assert_eq!(
            provider.handle_callback(&HashMap::new()).await.unwrap(),
            BrokerCallback::Cancelled
        );
    }
}
