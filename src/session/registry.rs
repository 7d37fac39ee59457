//! # Session Registry
//!
//! Process-wide table of live sessions keyed by [`SessionId`]. It is the only
//! state shared between session tasks, and every operation runs under one
//! mutex, which keeps the capacity check in `register` atomic with respect to
//! concurrent `register`/`unregister` calls.
//!
//! The registry never mutates a session. Each entry holds:
//! - a `watch::Receiver` for the state published by the session's relay task,
//! - the session's `CancellationToken`, used for graceful shutdown.
//!
//! ## Rust Concepts:
//! - **Mutex<HashMap>**: the table is small and operations are O(1), so a
//!   single lock is simpler than a reader-writer split.
//! - **watch channel**: single-writer, many-reader "latest value" cell.

use crate::session::machine::SessionState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Opaque session identifier handed to clients and operators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("maximum concurrent sessions ({limit}) reached")]
    CapacityExceeded { limit: usize },

    #[error("session '{0}' not found")]
    NotFound(SessionId),
}

/// Everything the relay task needs to own its registered session.
#[derive(Debug)]
pub struct SessionTicket {
    pub id: SessionId,
    /// Cancelled on graceful shutdown or when the connection closes
    pub cancel: CancellationToken,
    /// Publishes state changes to the registry
    pub state_tx: watch::Sender<SessionState>,
}

/// Read-only snapshot of a registered session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub id: SessionId,
    pub peer: Option<String>,
    pub state: SessionState,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug)]
struct SessionEntry {
    peer: Option<String>,
    opened_at: DateTime<Utc>,
    cancel: CancellationToken,
    state_rx: watch::Receiver<SessionState>,
}

impl SessionEntry {
    fn view(&self, id: &SessionId) -> SessionView {
        SessionView {
            id: id.clone(),
            peer: self.peer.clone(),
            state: *self.state_rx.borrow(),
            opened_at: self.opened_at,
        }
    }
}

#[derive(Debug)]
struct RegistryInner {
    sessions: HashMap<SessionId, SessionEntry>,
    capacity: usize,
    closing: bool,
}

#[derive(Debug)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                sessions: HashMap::new(),
                capacity,
                closing: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        // A panic while holding the lock cannot leave the map half-updated
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve a slot for a new connection.
    ///
    /// Fails with `CapacityExceeded` when the table is full or the server is
    /// shutting down; callers reject the handshake in that case.
    pub fn register(&self, peer: Option<String>) -> Result<SessionTicket, RegistryError> {
        let mut inner = self.lock();

        if inner.closing || inner.sessions.len() >= inner.capacity {
            return Err(RegistryError::CapacityExceeded {
                limit: inner.capacity,
            });
        }

        let id = SessionId::generate();
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);

        inner.sessions.insert(
            id.clone(),
            SessionEntry {
                peer,
                opened_at: Utc::now(),
                cancel: cancel.clone(),
                state_rx,
            },
        );

        Ok(SessionTicket { id, cancel, state_tx })
    }

    pub fn lookup(&self, id: &SessionId) -> Result<SessionView, RegistryError> {
        let inner = self.lock();
        inner
            .sessions
            .get(id)
            .map(|entry| entry.view(id))
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    /// Remove a session. Returns false if it was already gone.
    pub fn unregister(&self, id: &SessionId) -> bool {
        self.lock().sessions.remove(id).is_some()
    }

    pub fn list(&self) -> Vec<SessionView> {
        let inner = self.lock();
        let mut views: Vec<SessionView> = inner
            .sessions
            .iter()
            .map(|(id, entry)| entry.view(id))
            .collect();
        views.sort_by_key(|view| view.opened_at);
        views
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Change the session limit. Existing sessions above a lowered limit are
    /// left alone; only new registrations are refused.
    pub fn set_capacity(&self, capacity: usize) {
        self.lock().capacity = capacity;
    }

    /// Count sessions per state, including states with zero sessions.
    pub fn state_counts(&self) -> HashMap<&'static str, usize> {
        let inner = self.lock();
        let mut counts: HashMap<&'static str, usize> =
            SessionState::ALL.iter().map(|state| (state.as_str(), 0)).collect();
        for entry in inner.sessions.values() {
            *counts.entry(entry.state_rx.borrow().as_str()).or_insert(0) += 1;
        }
        counts
    }

    /// Refuse new sessions and cancel every live one.
    ///
    /// Returns how many sessions were signalled. Each relay task unregisters
    /// itself as it winds down.
    pub fn shutdown_all(&self) -> usize {
        let mut inner = self.lock();
        inner.closing = true;
        for entry in inner.sessions.values() {
            entry.cancel.cancel();
        }
        inner.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_register_and_lookup() {
        let registry = SessionRegistry::new(2);
        let ticket = registry.register(Some("127.0.0.1:5000".to_string())).unwrap();

        let view = registry.lookup(&ticket.id).unwrap();
        assert_eq!(view.state, SessionState::Idle);
        assert_eq!(view.peer.as_deref(), Some("127.0.0.1:5000"));

        ticket.state_tx.send_replace(SessionState::Listening);
        assert_eq!(registry.lookup(&ticket.id).unwrap().state, SessionState::Listening);
    }

    #[test]
    fn test_capacity_exceeded_leaves_existing_sessions() {
        let registry = SessionRegistry::new(3);
        let tickets: Vec<_> = (0..3).map(|_| registry.register(None).unwrap()).collect();

        let err = registry.register(None).unwrap_err();
        assert_eq!(err, RegistryError::CapacityExceeded { limit: 3 });

        assert_eq!(registry.len(), 3);
        for ticket in &tickets {
            assert!(registry.lookup(&ticket.id).is_ok());
            assert!(!ticket.cancel.is_cancelled());
        }
    }

    #[test]
    fn test_unregister_frees_a_slot() {
        let registry = SessionRegistry::new(1);
        let ticket = registry.register(None).unwrap();
        assert!(registry.register(None).is_err());

        assert!(registry.unregister(&ticket.id));
        assert!(!registry.unregister(&ticket.id));
        assert!(registry.register(None).is_ok());
    }

    #[test]
    fn test_lookup_unknown_session() {
        let registry = SessionRegistry::new(1);
        let id = SessionId::from("missing");
        assert_eq!(registry.lookup(&id).unwrap_err(), RegistryError::NotFound(id));
    }

    #[test]
    fn test_shutdown_cancels_and_refuses() {
        let registry = SessionRegistry::new(4);
        let first = registry.register(None).unwrap();
        let second = registry.register(None).unwrap();

        assert_eq!(registry.shutdown_all(), 2);
        assert!(first.cancel.is_cancelled());
        assert!(second.cancel.is_cancelled());
        assert!(matches!(
            registry.register(None),
            Err(RegistryError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn test_state_counts() {
        let registry = SessionRegistry::new(4);
        let a = registry.register(None).unwrap();
        let _b = registry.register(None).unwrap();
        a.state_tx.send_replace(SessionState::Speaking);

        let counts = registry.state_counts();
        assert_eq!(counts["idle"], 1);
        assert_eq!(counts["speaking"], 1);
        assert_eq!(counts["thinking"], 0);
    }

    #[test]
    fn test_concurrent_registration_respects_capacity() {
        let registry = Arc::new(SessionRegistry::new(10));
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.register(None).ok())
            })
            .collect();

        let accepted: Vec<_> = handles
            .into_iter()
            .filter_map(|handle| handle.join().unwrap())
            .collect();

        assert_eq!(accepted.len(), 10);
        assert_eq!(registry.len(), 10);
    }
}
