//! Brute-force lockout contract.
//!
//! Failure counting lives outside this crate; broker logins only ask whether
//! a user is currently locked.

use async_trait::async_trait;

use super::identity::User;

/// Reports temporary lockouts.
#[async_trait]
pub trait BruteForceProtector: Send + Sync {
    /// Returns `true` if `user` is temporarily locked out.
    async fn is_temporarily_disabled(&self, user: &User) -> bool;
}

/// Protector that never locks anyone out.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBruteForceProtection;

#[async_trait]
impl BruteForceProtector for NoBruteForceProtection {
    async fn is_temporarily_disabled(&self, _user: &User) -> bool {
        false
    }
}
