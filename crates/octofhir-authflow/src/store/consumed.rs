//! Realm-wide record of consumed single-use action tokens.
//!
//! Complements the per-session marker note: the marker only protects the
//! session it lives in, this store also catches a token replayed into a
//! fresh session.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::AuthResult;

/// Storage trait for consumed token keys.
#[async_trait]
pub trait ConsumedTokenStore: Send + Sync {
    /// Records `key` as used until `expires_at` (Unix timestamp).
    ///
    /// # Atomicity
    ///
    /// Check and insert happen as one step; of two concurrent calls for the
    /// same key exactly one returns `true`.
    ///
    /// # Returns
    ///
    /// Returns `true` if the key was not used before.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn mark_used(&self, key: &str, expires_at: i64) -> AuthResult<bool>;

    /// Returns `true` if `key` was consumed.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn is_used(&self, key: &str) -> AuthResult<bool>;

    /// Forgets keys whose tokens expired before `now`.
    ///
    /// Expired tokens fail verification, so their keys are no longer needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn remove_expired(&self, now: i64) -> AuthResult<usize>;
}

/// In-memory consumed token store.
#[derive(Debug, Default)]
pub struct InMemoryConsumedTokenStore {
    keys: DashMap<String, i64>,
}

impl InMemoryConsumedTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConsumedTokenStore for InMemoryConsumedTokenStore {
    async fn mark_used(&self, key: &str, expires_at: i64) -> AuthResult<bool> {
        match self.keys.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                entry.insert(expires_at);
                Ok(true)
            }
        }
    }

    async fn is_used(&self, key: &str) -> AuthResult<bool> {
        Ok(self.keys.contains_key(key))
    }

    async fn remove_expired(&self, now: i64) -> AuthResult<usize> {
        let before = self.keys.len();
        self.keys.retain(|_, expires_at| *expires_at >= now);
        Ok(before.saturating_sub(self.keys.len()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_mark_used_once() {
        let store = InMemoryConsumedTokenStore::new();
        assert!(store.mark_used("u.100.n1", 100).await.unwrap());
        assert!(!store.mark_used("u.100.n1", 100).await.unwrap());
        assert!(store.is_used("u.100.n1").await.unwrap());
        assert!(!store.is_used("u.100.n2").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_marks_have_one_winner() {
        let store = Arc::new(InMemoryConsumedTokenStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.mark_used("u.100.n1", 100).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_remove_expired() {
        let store = InMemoryConsumedTokenStore::new();
        store.mark_used("a", 100).await.unwrap();
        store.mark_used("b", 200).await.unwrap();

        assert_eq!(store.remove_expired(150).await.unwrap(), 1);
        assert!(!store.is_used("a").await.unwrap());
        assert!(store.is_used("b").await.unwrap());
    }
}
