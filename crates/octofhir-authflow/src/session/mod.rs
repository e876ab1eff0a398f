//! Auth sessions.
//!
//! - [`model`] - The session record and its note maps
//! - [`notes`] - Reserved note keys and typed accessors
//! - [`code`] - Short-lived session codes
//! - [`store`] - Storage trait and in-memory implementation

pub mod code;
pub mod model;
pub mod notes;
pub mod store;

pub use code::{SessionCode, issue_code};
pub use model::AuthSession;
pub use notes::{
    APP_INITIATED_FLOW_NOTE, AUTHENTICATE_PATH, CoreNote, FIRST_BROKER_LOGIN_PATH,
    IDENTITY_PROVIDER_NOTE, IDENTITY_PROVIDER_USERNAME_NOTE, LinkingIntent,
    POST_BROKER_LOGIN_PATH, STATE_NOTE,
};
pub use store::{AuthSessionStore, InMemoryAuthSessionStore, SessionLock};
