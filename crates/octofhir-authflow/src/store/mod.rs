//! Storage contracts for the state the flows read and write.
//!
//! - [`identity`] - Users and federated identity links
//! - [`user_session`] - Logged-in user sessions and their client sessions
//! - [`consumed`] - Realm-wide consumed action token keys
//! - [`brute_force`] - Lockout checks
//!
//! Each contract ships with an in-memory implementation.

pub mod brute_force;
pub mod consumed;
pub mod identity;
pub mod user_session;

pub use brute_force::{BruteForceProtector, NoBruteForceProtection};
pub use consumed::{ConsumedTokenStore, InMemoryConsumedTokenStore};
pub use identity::{
    FederatedIdentityLink, IdentityStore, InMemoryIdentityStore, MANAGE_ACCOUNT_LINKS_ROLE,
    MANAGE_ACCOUNT_ROLE, READ_TOKEN_ROLE, User, VERIFY_EMAIL_ACTION,
};
pub use user_session::{ClientSession, InMemoryUserSessionStore, UserSession, UserSessionStore};
