//! Dependency bundle shared by the coordinator, the broker engine, the
//! linking handshake and the HTTP handlers.

use std::sync::Arc;

use crate::AuthResult;
use crate::actions::ActionRegistry;
use crate::broker::{IdentityProvider, ProviderRegistry};
use crate::clock::{Clock, SystemClock};
use crate::config::AuthFlowConfig;
use crate::error::AuthError;
use crate::flow::{FlowExecutor, FlowProcessor, ImmediateFlowExecutor};
use crate::realm::Realm;
use crate::session::{AuthSessionStore, InMemoryAuthSessionStore};
use crate::store::{
    BruteForceProtector, ConsumedTokenStore, IdentityStore, InMemoryConsumedTokenStore,
    InMemoryIdentityStore, InMemoryUserSessionStore, NoBruteForceProtection, UserSessionStore,
};
use crate::token::ActionTokenCodec;
use crate::urls::Urls;

/// Everything a flow operation may touch.
pub struct AuthFlowServices {
    pub config: AuthFlowConfig,
    pub realm: Arc<Realm>,
    pub codec: Arc<ActionTokenCodec>,
    pub registry: Arc<ActionRegistry>,
    pub sessions: Arc<dyn AuthSessionStore>,
    pub user_sessions: Arc<dyn UserSessionStore>,
    pub identities: Arc<dyn IdentityStore>,
    pub consumed: Arc<dyn ConsumedTokenStore>,
    pub flows: Arc<FlowProcessor>,
    pub providers: ProviderRegistry,
    pub brute_force: Arc<dyn BruteForceProtector>,
    pub clock: Arc<dyn Clock>,
    pub urls: Urls,
}

impl AuthFlowServices {
    /// Starts a builder with in-memory defaults for every collaborator.
    #[must_use]
    pub fn builder(config: AuthFlowConfig) -> AuthFlowServicesBuilder {
        AuthFlowServicesBuilder {
            config,
            clock: None,
            sessions: None,
            user_sessions: None,
            identities: None,
            consumed: None,
            executor: None,
            registry: None,
            providers: ProviderRegistry::new(),
            brute_force: None,
        }
    }
}

impl std::fmt::Debug for AuthFlowServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthFlowServices")
            .field("realm", &self.realm.name)
            .field("issuer", &self.codec.issuer())
            .field("providers", &self.providers)
            .finish_non_exhaustive()
    }
}

/// Builder for [`AuthFlowServices`].
pub struct AuthFlowServicesBuilder {
    config: AuthFlowConfig,
    clock: Option<Arc<dyn Clock>>,
    sessions: Option<Arc<dyn AuthSessionStore>>,
    user_sessions: Option<Arc<dyn UserSessionStore>>,
    identities: Option<Arc<dyn IdentityStore>>,
    consumed: Option<Arc<dyn ConsumedTokenStore>>,
    executor: Option<Arc<dyn FlowExecutor>>,
    registry: Option<ActionRegistry>,
    providers: ProviderRegistry,
    brute_force: Option<Arc<dyn BruteForceProtector>>,
}

impl AuthFlowServicesBuilder {
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn sessions(mut self, sessions: Arc<dyn AuthSessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    #[must_use]
    pub fn user_sessions(mut self, user_sessions: Arc<dyn UserSessionStore>) -> Self {
        self.user_sessions = Some(user_sessions);
        self
    }

    #[must_use]
    pub fn identities(mut self, identities: Arc<dyn IdentityStore>) -> Self {
        self.identities = Some(identities);
        self
    }

    #[must_use]
    pub fn consumed_tokens(mut self, consumed: Arc<dyn ConsumedTokenStore>) -> Self {
        self.consumed = Some(consumed);
        self
    }

    /// Replaces the development flow executor.
    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn FlowExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Replaces the built-in action handlers.
    #[must_use]
    pub fn registry(mut self, registry: ActionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.providers.register(provider);
        self
    }

    #[must_use]
    pub fn brute_force(mut self, protector: Arc<dyn BruteForceProtector>) -> Self {
        self.brute_force = Some(protector);
        self
    }

    /// Validates the configuration and wires the bundle.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Configuration` if the configuration is invalid.
    pub fn build(self) -> AuthResult<Arc<AuthFlowServices>> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| AuthError::configuration(e.to_string()))?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let realm = Arc::new(Realm::from_config(&config)?);
        let keys = config
            .action_tokens
            .key_ring()
            .map_err(|e| AuthError::configuration(e.to_string()))?;
        let codec = Arc::new(ActionTokenCodec::new(keys, config.issuer(), clock.clone()));

        let sessions = self.sessions.unwrap_or_else(|| {
            Arc::new(InMemoryAuthSessionStore::new(
                config.sessions.auth_session_lifespan,
                clock.clone(),
            ))
        });
        let user_sessions = self
            .user_sessions
            .unwrap_or_else(|| Arc::new(InMemoryUserSessionStore::new()));
        let identities = self
            .identities
            .unwrap_or_else(|| Arc::new(InMemoryIdentityStore::new()));
        let consumed = self
            .consumed
            .unwrap_or_else(|| Arc::new(InMemoryConsumedTokenStore::new()));
        let brute_force = self
            .brute_force
            .unwrap_or_else(|| Arc::new(NoBruteForceProtection));

        let executor = self.executor.unwrap_or_else(|| {
            Arc::new(ImmediateFlowExecutor::new(
                identities.clone(),
                user_sessions.clone(),
                realm.clone(),
                clock.clone(),
            ))
        });
        let urls = Urls::new(&realm.public_url);
        let flows = Arc::new(FlowProcessor::new(
            executor,
            sessions.clone(),
            realm.clone(),
            urls.clone(),
            clock.clone(),
        ));
        let registry = Arc::new(self.registry.unwrap_or_else(ActionRegistry::with_builtins));

        tracing::info!(
            realm = %realm.name,
            issuer = %codec.issuer(),
            actions = registry.len(),
            "Auth flow services initialized"
        );

        Ok(Arc::new(AuthFlowServices {
            config,
            realm,
            codec,
            registry,
            sessions,
            user_sessions,
            identities,
            consumed,
            flows,
            providers: self.providers,
            brute_force,
            clock,
            urls,
        }))
    }
}
