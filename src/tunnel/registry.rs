//! Session registry: the `sessionID → Terminal` mapping.
//!
//! A single mutex protects the map; every operation is a short critical
//! section with no I/O under the lock. Handles are cheap clones, so callers
//! take a terminal out of the lock before driving it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::terminal::Terminal;

/// Concurrent map of live sessions. Cloneable — all clones share the same
/// inner map.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, Terminal>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a session with this ID is registered.
    pub async fn has(&self, session_id: &str) -> bool {
        self.sessions.lock().await.contains_key(session_id)
    }

    /// Look up the terminal for a session.
    pub async fn get(&self, session_id: &str) -> Option<Terminal> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// Register a terminal under a session ID, returning any terminal that
    /// was previously registered under it.
    pub async fn set(&self, session_id: String, terminal: Terminal) -> Option<Terminal> {
        self.sessions.lock().await.insert(session_id, terminal)
    }

    /// Remove a session, returning its terminal if it was registered.
    pub async fn clear(&self, session_id: &str) -> Option<Terminal> {
        self.sessions.lock().await.remove(session_id)
    }

    /// Atomically empty the registry, handing every live session back to the
    /// caller. Used by tunnel teardown so session IDs never survive a
    /// reconnect.
    pub async fn drain(&self) -> Vec<(String, Terminal)> {
        self.sessions.lock().await.drain().collect()
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}
