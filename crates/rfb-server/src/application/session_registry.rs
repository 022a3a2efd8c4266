//! SessionRegistry: one desktop session per user identity.
//!
//! The registry is the only structure shared between threads.  Lookup and
//! insertion happen under one lock, so two connections authenticating as the
//! same identity at the same moment always end up in the same session.
//!
//! # Ownership (for beginners)
//!
//! A session is handed out as a [`SessionHandle`], an `Arc<Mutex<_>>`.  The
//! registry keeps one strong reference; every connection routed to the
//! session keeps another.  Removing the registry entry tears the session
//! down (clients disconnected, desktop stopped) even if some connection
//! still holds a handle, so a late event finds an empty, stopped session
//! rather than a dangling one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use super::desktop_session::{DesktopSession, SessionError};
use super::policy::SessionPolicy;
use crate::infrastructure::backend::BackendFactory;

/// Shared, lockable reference to one session.
pub type SessionHandle = Arc<Mutex<DesktopSession>>;

/// Locks `handle`, recovering the session if a previous holder panicked.
pub fn lock_session(handle: &SessionHandle) -> MutexGuard<'_, DesktopSession> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
    factory: Box<dyn BackendFactory>,
    policy: SessionPolicy,
}

impl SessionRegistry {
    pub fn new(factory: Box<dyn BackendFactory>, policy: SessionPolicy) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            factory,
            policy,
        }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Returns the session for `identity`, creating it on first use.
    ///
    /// # Errors
    ///
    /// [`SessionError::Backend`] if the factory has no backend for the
    /// identity.  Nothing is registered in that case.
    pub fn get_or_create(&self, identity: &str) -> Result<SessionHandle, SessionError> {
        let mut sessions = self.lock_sessions();
        if let Some(handle) = sessions.get(identity) {
            return Ok(Arc::clone(handle));
        }

        let backend = self.factory.create(identity)?;
        let session = DesktopSession::new(identity, backend, self.policy.clone());
        let handle = Arc::new(Mutex::new(session));
        sessions.insert(identity.to_string(), Arc::clone(&handle));
        info!("created desktop session for {identity}");
        Ok(handle)
    }

    pub fn get(&self, identity: &str) -> Option<SessionHandle> {
        self.lock_sessions().get(identity).cloned()
    }

    /// Drops the entry for `identity` and tears its session down.
    ///
    /// Returns `false` if there was no such session.
    pub fn remove(&self, identity: &str) -> bool {
        // Release the registry lock before touching the session.
        let removed = self.lock_sessions().remove(identity);
        match removed {
            Some(handle) => {
                debug!("removing desktop session for {identity}");
                lock_session(&handle).shutdown();
                true
            }
            None => false,
        }
    }

    /// Handles to every live session, in no particular order.
    pub fn sessions(&self) -> Vec<SessionHandle> {
        self.lock_sessions().values().cloned().collect()
    }

    pub fn identities(&self) -> Vec<String> {
        self.lock_sessions().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_sessions().is_empty()
    }

    /// Tears down every session and empties the registry.
    pub fn shutdown_all(&self) {
        let drained: Vec<SessionHandle> = self.lock_sessions().drain().map(|(_, h)| h).collect();
        for handle in drained {
            lock_session(&handle).shutdown();
        }
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::client_connection::{AccessRights, ClientConnection};
    use crate::application::desktop_session::{Admission, REASON_SERVER_SHUTDOWN};
    use crate::infrastructure::backend::mock::RecordingBackend;
    use crate::infrastructure::backend::{BackendError, DesktopBackend};
    use crate::infrastructure::transport::mock::RecordingTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use uuid::Uuid;

    fn counting_registry() -> (SessionRegistry, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let factory = move |identity: &str| -> Result<Box<dyn DesktopBackend>, BackendError> {
            if identity == "nobody" {
                return Err(BackendError::UnknownIdentity(identity.to_string()));
            }
            counter.fetch_add(1, Ordering::SeqCst);
            let (backend, _) = RecordingBackend::new(64, 64);
            Ok(Box::new(backend))
        };
        (
            SessionRegistry::new(Box::new(factory), SessionPolicy::default()),
            created,
        )
    }

    #[test]
    fn test_get_or_create_returns_same_session_for_same_identity() {
        // Arrange
        let (registry, created) = counting_registry();

        // Act
        let first = registry.get_or_create("alice").expect("create");
        let second = registry.get_or_create("alice").expect("lookup");

        // Assert
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_or_create_keeps_identities_apart() {
        let (registry, created) = counting_registry();

        let alice = registry.get_or_create("alice").expect("alice");
        let bob = registry.get_or_create("bob").expect("bob");

        assert!(!Arc::ptr_eq(&alice, &bob));
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(lock_session(&bob).identity(), "bob");
    }

    #[test]
    fn test_get_or_create_propagates_factory_failure_without_registering() {
        let (registry, _) = counting_registry();

        let result = registry.get_or_create("nobody");

        assert!(matches!(
            result,
            Err(SessionError::Backend(BackendError::UnknownIdentity(_)))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_get_or_create_creates_one_session() {
        // Arrange
        let (registry, created) = counting_registry();

        // Act
        let handles: Vec<SessionHandle> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| registry.get_or_create("carol").expect("create")))
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().expect("worker panicked"))
                .collect()
        });

        // Assert
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(handles.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    }

    #[test]
    fn test_remove_tears_down_session_and_disconnects_clients() {
        // Arrange
        let (registry, _) = counting_registry();
        let handle = registry.get_or_create("dave").expect("create");
        let (transport, probe) = RecordingTransport::new("10.1.1.1:5901");
        {
            let mut session = lock_session(&handle);
            session.start_desktop().expect("start");
            let mut client = ClientConnection::new(Uuid::new_v4(), Box::new(transport), Instant::now());
            client.mark_authenticated(AccessRights::FULL);
            assert!(matches!(session.client_ready(client, true), Admission::Joined));
        }

        // Act
        let removed = registry.remove("dave");

        // Assert
        assert!(removed);
        assert!(registry.get("dave").is_none());
        assert_eq!(probe.shutdown_reason().as_deref(), Some(REASON_SERVER_SHUTDOWN));
        let session = lock_session(&handle);
        assert!(!session.is_started());
        assert!(session.clients().is_empty());
    }

    #[test]
    fn test_remove_unknown_identity_returns_false() {
        let (registry, _) = counting_registry();
        assert!(!registry.remove("eve"));
    }

    #[test]
    fn test_shutdown_all_empties_registry() {
        let (registry, _) = counting_registry();
        registry.get_or_create("alice").expect("alice");
        registry.get_or_create("bob").expect("bob");

        registry.shutdown_all();

        assert!(registry.is_empty());
    }
}
