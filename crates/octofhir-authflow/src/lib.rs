//! # octofhir-authflow
//!
//! Authentication continuation and identity broker linking for the OctoFHIR
//! server.
//!
//! This crate provides:
//! - Signed, single-use action tokens that resume a login from an e-mailed link
//! - Session resumption with replay and hijack protection
//! - The account linking state machine run after an external provider login
//! - The nonce/hash handshake for application-initiated account linking
//!
//! ## Overview
//!
//! A login is a sequence of independent HTTP requests. Everything that must
//! survive between them lives in an [`session::AuthSession`] (server-side,
//! addressed by cookie or session code) or in a signed [`token::ActionToken`].
//! The interactive steps themselves are delegated to a [`flow::FlowExecutor`].
//!
//! ## Modules
//!
//! - [`config`] - Flow configuration
//! - [`token`] - Action token codec and signing keys
//! - [`actions`] - Action handlers by action id
//! - [`session`] - Auth sessions, reserved notes and session codes
//! - [`resume`] - Session resumption from action tokens
//! - [`broker`] - Brokered identities and the account linking engine
//! - [`linking`] - Client-initiated linking handshake
//! - [`flow`] - Flow executor contract and processor
//! - [`store`] - Users, federated identities, user sessions, consumed tokens
//! - [`http`] - Axum handlers for the flow endpoints

pub mod actions;
pub mod broker;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod flow;
pub mod http;
pub mod linking;
pub mod outcome;
pub mod realm;
pub mod resume;
pub mod services;
pub mod session;
pub mod store;
pub mod token;
pub mod urls;

pub use actions::{ActionBody, ActionContext, ActionHandler, ActionRegistry};
pub use broker::{
    AccountLinkingEngine, BrokerCallback, BrokerStage, BrokerState, BrokerStep,
    BrokeredIdentityContext, IdentityProvider, LoginRequest, ProviderRegistry,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{AuthFlowConfig, ConfigError};
pub use error::{AuthError, ErrorCategory};
pub use flow::{Completion, FlowDisposition, FlowExecutor, FlowProcessor, FlowRequest};
pub use http::{AuthFlowState, router};
pub use linking::{
    ClientInitiatedLinking, LinkInitiation, LinkRejection, LinkRequest, compute_link_hash,
    verify_link_hash,
};
pub use outcome::{Outcome, Page, PageKind};
pub use resume::{
    ResumeError, ResumeRequest, Resumption, SessionDisposition, SessionResumptionCoordinator,
};
pub use services::{AuthFlowServices, AuthFlowServicesBuilder};
pub use session::{AuthSession, AuthSessionStore, InMemoryAuthSessionStore};
pub use token::{ActionToken, ActionTokenCodec, SigningKey, SigningKeyRing, TokenError};

/// Type alias for auth flow results.
pub type AuthResult<T> = Result<T, AuthError>;
