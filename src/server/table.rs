//! Session table.
//!
//! The registry of live sessions, shared by every connection for the
//! lifetime of the server. Entries are inserted fully constructed and
//! removed during teardown.

use crate::session::{Session, SessionId, SessionInfo};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Arc<Session>>,
    /// IDs handed out but not yet inserted (spawn in progress).
    reserved: HashSet<SessionId>,
    name_counter: HashMap<String, u32>,
}

impl Inner {
    fn is_taken(&self, id: &str) -> bool {
        self.sessions.contains_key(id) || self.reserved.contains(id)
    }
}

/// Manages all live sessions.
#[derive(Default)]
pub struct SessionTable {
    inner: Mutex<Inner>,
}

impl SessionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand out a unique session ID (e.g., "rusty-nail").
    ///
    /// The ID stays reserved until it is either inserted or released.
    pub fn reserve_id(&self) -> SessionId {
        let mut inner = self.lock();
        let mut generator = names::Generator::default();
        loop {
            let base_name = generator.next().unwrap_or_else(|| "session".to_string());

            // Check if this name is already used
            if !inner.is_taken(&base_name) {
                inner.reserved.insert(base_name.clone());
                return base_name;
            }

            // If used, append a counter
            let counter = inner.name_counter.entry(base_name.clone()).or_insert(1);
            *counter += 1;
            let numbered_name = format!("{base_name}-{counter}");

            if !inner.is_taken(&numbered_name) {
                inner.reserved.insert(numbered_name.clone());
                return numbered_name;
            }
        }
    }

    /// Give back a reserved ID that will never be inserted.
    pub fn release(&self, id: &str) {
        self.lock().reserved.remove(id);
    }

    /// Add a session under its own ID.
    pub fn insert(&self, session: Arc<Session>) {
        let mut inner = self.lock();
        inner.reserved.remove(session.id());
        inner.sessions.insert(session.id().to_string(), session);
    }

    /// Get a session by ID.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.lock().sessions.get(id).cloned()
    }

    /// Remove a session by ID.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.lock().sessions.remove(id)
    }

    /// Check if a session with this ID is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.lock().sessions.contains_key(id)
    }

    /// All registered sessions.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.lock().sessions.values().cloned().collect()
    }

    /// Snapshots of all registered sessions, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .lock()
            .sessions
            .values()
            .map(|session| session.info())
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    /// Get the number of sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Check if there are no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_id_uniqueness() {
        let table = SessionTable::new();

        // Generate many IDs and verify they're all unique
        let mut ids = std::collections::HashSet::new();
        for _ in 0..100 {
            let id = table.reserve_id();
            assert!(ids.insert(id.clone()), "Generated duplicate ID: {id}");
        }
    }

    #[test]
    fn test_reserve_id_format() {
        let table = SessionTable::new();
        let id = table.reserve_id();

        // Should be adjective-noun format (contains a hyphen)
        assert!(id.contains('-'), "ID should be adjective-noun format: {id}");

        // Should be lowercase
        assert_eq!(id, id.to_lowercase(), "ID should be lowercase: {id}");
    }

    #[test]
    fn test_reserved_ids_are_not_sessions() {
        let table = SessionTable::new();
        let id = table.reserve_id();
        assert!(!table.contains(&id));
        assert!(table.is_empty());

        table.release(&id);
        assert!(table.get(&id).is_none());
        assert_eq!(table.len(), 0);
        assert!(table.list().is_empty());
    }
}
