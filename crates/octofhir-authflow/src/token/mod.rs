//! Signed, single-use action tokens.
//!
//! - [`claims`] - The claim set carried by a token
//! - [`codec`] - Signing keys, issuing and verification

pub mod claims;
pub mod codec;

pub use claims::ActionToken;
pub use codec::{
    ActionTokenBuilder, ActionTokenCodec, MAX_TOKEN_LENGTH, SigningKey, SigningKeyRing, TokenError,
};
