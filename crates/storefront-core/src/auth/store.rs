use std::sync::{Mutex, PoisonError, RwLock};

use anyhow::Result;
use tracing::{debug, warn};

use super::refresh::RefreshCoordinator;
use super::session::{Session, UserProfile};

/// Process-wide holder of the current session.
///
/// Passed to the `ApiClient` as `Arc<dyn SessionStore>`. Every mutation is
/// atomic with respect to readers. Writers return an error only when the
/// durable copy could not be updated; the in-memory state has changed
/// regardless.
pub trait SessionStore: Send + Sync {
    fn snapshot(&self) -> Option<Session>;

    fn set_session(
        &self,
        access_token: String,
        refresh_token: Option<String>,
        user: Option<UserProfile>,
    ) -> Result<()>;

    /// Swap in refreshed tokens, keeping the user. No-op without a session.
    fn update_tokens(&self, access_token: String, refresh_token: Option<String>) -> Result<()>;

    /// Replace the profile. No-op without a session.
    fn set_user(&self, user: UserProfile) -> Result<()>;

    /// Remove the session, returning what was there
    fn take_session(&self) -> Result<Option<Session>>;

    /// The single-flight refresh shared by every client using this store
    fn refresh_coordinator(&self) -> &RefreshCoordinator;

    fn clear_session(&self) -> Result<()> {
        self.take_session().map(|_| ())
    }

    fn access_token(&self) -> Option<String> {
        self.snapshot()
            .map(|s| s.access_token)
            .filter(|t| !t.is_empty())
    }

    fn refresh_token(&self) -> Option<String> {
        self.snapshot().and_then(|s| s.refresh_token)
    }

    fn user(&self) -> Option<UserProfile> {
        self.snapshot().and_then(|s| s.user)
    }

    fn is_authenticated(&self) -> bool {
        self.snapshot().map(|s| s.is_authenticated()).unwrap_or(false)
    }
}

/// Somewhere a session outlives the process
pub trait SessionBackend: Send + Sync {
    fn read(&self) -> Result<Option<Session>>;
    fn write(&self, session: &Session) -> Result<()>;
    fn erase(&self) -> Result<()>;
}

/// Session held only for the lifetime of the process
#[derive(Default)]
pub struct MemorySessionStore {
    state: RwLock<Option<Session>>,
    refresh: RefreshCoordinator,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            state: RwLock::new(Some(session)),
            refresh: RefreshCoordinator::new(),
        }
    }

    /// Apply `f` to the current session under the write lock
    fn modify<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut Session),
    {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match state.as_mut() {
            Some(session) => {
                f(session);
                true
            }
            None => false,
        }
    }

    fn replace(&self, session: Option<Session>) -> Option<Session> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *state, session)
    }
}

impl SessionStore for MemorySessionStore {
    fn snapshot(&self) -> Option<Session> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_session(
        &self,
        access_token: String,
        refresh_token: Option<String>,
        user: Option<UserProfile>,
    ) -> Result<()> {
        self.replace(Some(Session::new(access_token, refresh_token, user)));
        Ok(())
    }

    fn update_tokens(&self, access_token: String, refresh_token: Option<String>) -> Result<()> {
        if !self.modify(|s| s.rotate(access_token, refresh_token)) {
            debug!("No session to update with refreshed tokens");
        }
        Ok(())
    }

    fn set_user(&self, user: UserProfile) -> Result<()> {
        if !self.modify(|s| s.set_user(user)) {
            debug!("No session to attach profile to");
        }
        Ok(())
    }

    fn take_session(&self) -> Result<Option<Session>> {
        Ok(self.replace(None))
    }

    fn refresh_coordinator(&self) -> &RefreshCoordinator {
        &self.refresh
    }
}

/// Memory store mirrored to a `SessionBackend` after every write
pub struct DurableSessionStore<B> {
    memory: MemorySessionStore,
    backend: B,
    /// Serializes snapshot-then-write so the backend never lags behind a
    /// concurrent writer
    persist_lock: Mutex<()>,
}

impl<B: SessionBackend> DurableSessionStore<B> {
    /// Load whatever the backend holds. An unreadable record starts the
    /// process signed out.
    pub fn open(backend: B) -> Self {
        let initial = match backend.read() {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable stored session");
                None
            }
        };
        debug!(has_session = initial.is_some(), "Session store opened");

        let memory = match initial {
            Some(session) => MemorySessionStore::with_session(session),
            None => MemorySessionStore::new(),
        };

        Self {
            memory,
            backend,
            persist_lock: Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match self.memory.snapshot() {
            Some(session) => self.backend.write(&session),
            None => self.backend.erase(),
        }
    }
}

impl<B: SessionBackend> SessionStore for DurableSessionStore<B> {
    fn snapshot(&self) -> Option<Session> {
        self.memory.snapshot()
    }

    fn set_session(
        &self,
        access_token: String,
        refresh_token: Option<String>,
        user: Option<UserProfile>,
    ) -> Result<()> {
        self.memory.set_session(access_token, refresh_token, user)?;
        self.persist()
    }

    fn update_tokens(&self, access_token: String, refresh_token: Option<String>) -> Result<()> {
        self.memory.update_tokens(access_token, refresh_token)?;
        self.persist()
    }

    fn set_user(&self, user: UserProfile) -> Result<()> {
        self.memory.set_user(user)?;
        self.persist()
    }

    fn take_session(&self) -> Result<Option<Session>> {
        let previous = self.memory.take_session()?;
        self.persist()?;
        Ok(previous)
    }

    fn refresh_coordinator(&self) -> &RefreshCoordinator {
        self.memory.refresh_coordinator()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> UserProfile {
        UserProfile {
            id: Some("u1".into()),
            email: Some("jo@example.com".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_set_session_round_trip() {
        let store = MemorySessionStore::new();
        store
            .set_session("a".into(), Some("r".into()), Some(profile()))
            .unwrap();

        assert_eq!(store.access_token().as_deref(), Some("a"));
        assert_eq!(store.refresh_token().as_deref(), Some("r"));
        assert_eq!(store.user(), Some(profile()));
        assert!(store.is_authenticated());
    }

    #[test]
    fn test_clear_session() {
        let store = MemorySessionStore::new();
        store
            .set_session("a".into(), Some("r".into()), Some(profile()))
            .unwrap();
        store.clear_session().unwrap();

        assert!(!store.is_authenticated());
        assert!(store.access_token().is_none());
        assert!(store.refresh_token().is_none());
        assert!(store.take_session().unwrap().is_none());
    }

    #[test]
    fn test_token_without_user_is_not_authenticated() {
        let store = MemorySessionStore::new();
        store.set_session("a".into(), Some("r".into()), None).unwrap();
        assert!(!store.is_authenticated());
    }

    #[test]
    fn test_updates_without_session_are_ignored() {
        let store = MemorySessionStore::new();
        store.update_tokens("a".into(), Some("r".into())).unwrap();
        store.set_user(profile()).unwrap();
        assert!(store.snapshot().is_none());
    }

    #[test]
    fn test_update_tokens_keeps_user() {
        let store = MemorySessionStore::new();
        store
            .set_session("a1".into(), Some("r1".into()), Some(profile()))
            .unwrap();
        store.update_tokens("a2".into(), None).unwrap();

        assert_eq!(store.access_token().as_deref(), Some("a2"));
        assert_eq!(store.refresh_token().as_deref(), Some("r1"));
        assert_eq!(store.user(), Some(profile()));
    }
}
