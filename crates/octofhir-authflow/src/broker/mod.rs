//! Identity brokering.
//!
//! - [`context`] - Brokered identity and how it is parked on the session
//! - [`provider`] - External provider contract and registry
//! - [`engine`] - Account linking decisions after a broker login

pub mod context;
pub mod engine;
pub mod provider;

pub use context::{BrokerStage, BrokeredIdentityContext};
pub use engine::{AccountLinkingEngine, BrokerState, BrokerStep};
pub use provider::{BrokerCallback, IdentityProvider, LoginRequest, ProviderRegistry};
