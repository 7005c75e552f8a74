//! Session ownership and id allocation.
//!
//! One coarse mutex guards the id→session map; critical sections are
//! bounded to insert/remove/lookup plus the shutdown-time iteration.
//! Sessions are handed out as `Arc` clones, so a reference obtained
//! before a racing remove stays valid until dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use gannet_core::{net_debug, net_warn};
use gannet_core::{SessionConfig, SessionId, SocketHandle};

use crate::session::Session;

pub struct SessionTable {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    /// Monotonic; 0 is reserved as the invalid id.
    next_id: AtomicU64,
    max_sessions: usize,
}

impl SessionTable {
    pub fn new(max_sessions: usize) -> Self {
        SessionTable {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_sessions,
        }
    }

    /// Create a session for `socket` and insert it.
    ///
    /// Returns `None` when the table is at capacity; the caller owns the
    /// socket's fate in that case.
    pub fn add(&self, socket: SocketHandle, config: &SessionConfig) -> Option<Arc<Session>> {
        let mut map = self.sessions.lock().unwrap();
        if map.len() >= self.max_sessions {
            net_warn!("session limit reached. max: {}", self.max_sessions);
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(id, socket, config));
        map.insert(id, Arc::clone(&session));

        net_debug!(
            "session added. id: {}, socket: {}, total: {}",
            id,
            socket,
            map.len()
        );
        Some(session)
    }

    /// Drop the session from the table. Closing the socket is the
    /// caller's prior responsibility.
    pub fn remove(&self, id: SessionId) -> bool {
        let mut map = self.sessions.lock().unwrap();
        let removed = map.remove(&id).is_some();
        if removed {
            net_debug!("session removed. id: {}, remaining: {}", id, map.len());
        }
        removed
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(&id).cloned()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.lock().unwrap().contains_key(&id)
    }

    /// Invoke `f` on every session, under the table lock.
    ///
    /// `f` must not call back into this table (add/remove/get would
    /// deadlock on the same mutex). The engine only uses this during
    /// shutdown.
    pub fn for_each<F: FnMut(&Arc<Session>)>(&self, mut f: F) {
        let map = self.sessions.lock().unwrap();
        for session in map.values() {
            f(session);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_sessions
    }

    pub fn clear(&self) {
        self.sessions.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gannet_core::{SessionState, INVALID_SESSION_ID, INVALID_SOCKET_HANDLE};
    use std::collections::HashSet;
    use std::thread;

    fn table(max: usize) -> SessionTable {
        SessionTable::new(max)
    }

    #[test]
    fn test_add_get_remove() {
        let t = table(4);
        let cfg = SessionConfig::default();
        let s = t.add(INVALID_SOCKET_HANDLE, &cfg).unwrap();
        assert_eq!(t.len(), 1);
        assert!(t.get(s.id()).is_some());
        assert!(t.remove(s.id()));
        assert!(!t.remove(s.id()));
        assert!(t.get(s.id()).is_none());
        assert!(t.is_empty());
    }

    #[test]
    fn test_capacity_cap() {
        let t = table(2);
        let cfg = SessionConfig::default();
        assert!(t.add(INVALID_SOCKET_HANDLE, &cfg).is_some());
        assert!(t.add(INVALID_SOCKET_HANDLE, &cfg).is_some());
        assert!(t.is_full());
        assert!(t.add(INVALID_SOCKET_HANDLE, &cfg).is_none());
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_ids_monotonic_and_never_zero() {
        let t = table(64);
        let cfg = SessionConfig::default();
        let mut last = INVALID_SESSION_ID;
        for _ in 0..64 {
            let s = t.add(INVALID_SOCKET_HANDLE, &cfg).unwrap();
            assert!(s.id() > last);
            last = s.id();
        }
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let t = Arc::new(table(1024));
        let mut handles = vec![];
        for _ in 0..8 {
            let t = Arc::clone(&t);
            handles.push(thread::spawn(move || {
                let cfg = SessionConfig::default();
                (0..100)
                    .map(|_| t.add(INVALID_SOCKET_HANDLE, &cfg).unwrap().id())
                    .collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert_ne!(id, INVALID_SESSION_ID);
                assert!(seen.insert(id), "duplicate session id {}", id);
            }
        }
    }

    #[test]
    fn test_arc_survives_remove() {
        let t = table(1);
        let cfg = SessionConfig::default();
        let s = t.add(INVALID_SOCKET_HANDLE, &cfg).unwrap();
        s.set_state(SessionState::Connected);
        t.remove(s.id());
        // The clone we hold is still usable after removal
        assert_eq!(s.state(), SessionState::Connected);
    }

    #[test]
    fn test_for_each_visits_all() {
        let t = table(8);
        let cfg = SessionConfig::default();
        for _ in 0..5 {
            t.add(INVALID_SOCKET_HANDLE, &cfg).unwrap();
        }
        let mut count = 0;
        t.for_each(|_| count += 1);
        assert_eq!(count, 5);
    }
}
