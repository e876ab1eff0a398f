//! Auth session storage.
//!
//! Sessions are keyed by id and mutated by at most one request at a time:
//! callers take [`AuthSessionStore::lock`] for the id before reading a
//! session they intend to write back, so the consumed-token marker written by
//! one request is always visible to the next.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::model::AuthSession;
use crate::AuthResult;
use crate::clock::Clock;
use crate::error::AuthError;

/// Exclusive access to one session id, released on drop.
#[derive(Debug)]
pub struct SessionLock {
    id: String,
    _guard: OwnedMutexGuard<()>,
}

impl SessionLock {
    /// Returns the locked session id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Storage trait for auth sessions.
#[async_trait]
pub trait AuthSessionStore: Send + Sync {
    /// Stores a new session, replacing any session with the same id.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn create(&self, session: &AuthSession) -> AuthResult<()>;

    /// Finds a session by id.
    ///
    /// # Returns
    ///
    /// Returns `None` if the session does not exist or has expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn get(&self, id: &str) -> AuthResult<Option<AuthSession>>;

    /// Writes back a modified session and refreshes its timestamp.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the session no longer exists.
    async fn update(&self, session: &AuthSession) -> AuthResult<()>;

    /// Removes a session.
    ///
    /// # Returns
    ///
    /// Returns `true` if a session was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn remove(&self, id: &str) -> AuthResult<bool>;

    /// Acquires exclusive access to `id`.
    ///
    /// # Atomicity
    ///
    /// Two holders of the lock for the same id never overlap. The lock does
    /// not require the session to exist.
    async fn lock(&self, id: &str) -> SessionLock;

    /// Removes sessions idle for longer than the configured lifespan.
    ///
    /// # Returns
    ///
    /// Returns the number of removed sessions.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn remove_expired(&self) -> AuthResult<usize>;
}

/// In-memory auth session store.
pub struct InMemoryAuthSessionStore {
    sessions: DashMap<String, AuthSession>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    lifespan: std::time::Duration,
    clock: Arc<dyn Clock>,
}

impl InMemoryAuthSessionStore {
    /// Creates a store whose sessions expire after `lifespan` without writes.
    #[must_use]
    pub fn new(lifespan: std::time::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: DashMap::new(),
            locks: DashMap::new(),
            lifespan,
            clock,
        }
    }

    /// Returns the number of stored sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` if no sessions are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl AuthSessionStore for InMemoryAuthSessionStore {
    async fn create(&self, session: &AuthSession) -> AuthResult<()> {
        let mut session = session.clone();
        session.updated_at = self.clock.now();
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get(&self, id: &str) -> AuthResult<Option<AuthSession>> {
        let now = self.clock.now();
        let Some(session) = self.sessions.get(id).map(|s| s.clone()) else {
            return Ok(None);
        };
        if session.is_expired(now, self.lifespan) {
            self.sessions.remove(id);
            return Ok(None);
        }
        Ok(Some(session))
    }

    async fn update(&self, session: &AuthSession) -> AuthResult<()> {
        let now = self.clock.now();
        match self.sessions.get_mut(&session.id) {
            Some(mut stored) => {
                *stored = session.clone();
                stored.updated_at = now;
                Ok(())
            }
            None => Err(AuthError::storage(format!(
                "auth session {} no longer exists",
                session.id
            ))),
        }
    }

    async fn remove(&self, id: &str) -> AuthResult<bool> {
        Ok(self.sessions.remove(id).is_some())
    }

    async fn lock(&self, id: &str) -> SessionLock {
        let mutex = self.locks.entry(id.to_string()).or_default().clone();
        SessionLock {
            id: id.to_string(),
            _guard: mutex.lock_owned().await,
        }
    }

    async fn remove_expired(&self) -> AuthResult<usize> {
        let now: OffsetDateTime = self.clock.now();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| !session.is_expired(now, self.lifespan));
        let removed = before.saturating_sub(self.sessions.len());

        // Drop lock entries nobody holds and no session needs.
        self.locks
            .retain(|id, lock| Arc::strong_count(lock) > 1 || self.sessions.contains_key(id));

        if removed > 0 {
            tracing::debug!(removed, "Removed expired auth sessions");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::FixedClock;

    fn store() -> (InMemoryAuthSessionStore, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::starting_now());
        let store = InMemoryAuthSessionStore::new(Duration::from_secs(1800), clock.clone());
        (store, clock)
    }

    #[tokio::test]
    async fn test_create_get_update_remove() {
        let (store, clock) = store();
        let mut session = AuthSession::new("s1", "portal", clock.now());
        store.create(&session).await.unwrap();

        session.set_note("k", "v");
        store.update(&session).await.unwrap();
        let loaded = store.get("s1").await.unwrap().unwrap();
        assert_eq!(loaded.note("k"), Some("v"));

        assert!(store.remove("s1").await.unwrap());
        assert!(store.get("s1").await.unwrap().is_none());
        assert!(!store.remove("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_of_removed_session_fails() {
        let (store, clock) = store();
        let session = AuthSession::new("s1", "portal", clock.now());
        let err = store.update(&session).await.unwrap_err();
        assert!(matches!(err, AuthError::Storage { .. }));
    }

    #[tokio::test]
    async fn test_expired_sessions_are_swept() {
        let (store, clock) = store();
        store
            .create(&AuthSession::new("old", "portal", clock.now()))
            .await
            .unwrap();
        clock.advance(time::Duration::minutes(20));
        store
            .create(&AuthSession::new("new", "portal", clock.now()))
            .await
            .unwrap();
        clock.advance(time::Duration::minutes(15));

        assert!(store.get("old").await.unwrap().is_none());
        assert_eq!(store.remove_expired().await.unwrap(), 0);
        assert!(store.get("new").await.unwrap().is_some());

        clock.advance(time::Duration::minutes(20));
        assert_eq!(store.remove_expired().await.unwrap(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_lock_serializes_access() {
        let (store, _) = store();
        let store = Arc::new(store);

        let guard = store.lock("s1").await;
        assert_eq!(guard.id(), "s1");

        let contender = {
            let store = store.clone();
            tokio::spawn(async move {
                let _guard = store.lock("s1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        // Other ids are not blocked.
        let _other = store.lock("s2").await;

        drop(guard);
        contender.await.unwrap();
    }
}
