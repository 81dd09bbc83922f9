//! Session registry.
//!
//! The registry is the only authority on which operators are live. A single
//! lock covers both the connection map and the per-route index, so every
//! read sees one consistent point in time.

use crate::session::{ConnectionId, RouteId, Session};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tracing::trace;

#[derive(Debug, Default)]
struct RegistryInner {
    sessions: HashMap<ConnectionId, Session>,
    by_route: HashMap<RouteId, HashSet<ConnectionId>>,
}

impl RegistryInner {
    fn unindex(&mut self, route_id: &str, connection_id: &str) {
        if let Some(connections) = self.by_route.get_mut(route_id) {
            connections.remove(connection_id);
            if connections.is_empty() {
                self.by_route.remove(route_id);
            }
        }
    }
}

/// In-memory map from connection to active session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a session, returning the one it replaced.
    pub fn put(&self, connection_id: impl Into<ConnectionId>, session: Session) -> Option<Session> {
        let connection_id = connection_id.into();
        let mut inner = self.inner.write();

        let replaced = inner.sessions.insert(connection_id.clone(), session.clone());
        if let Some(old) = &replaced {
            inner.unindex(old.route_id(), &connection_id);
        }
        inner
            .by_route
            .entry(session.route_id().to_string())
            .or_default()
            .insert(connection_id.clone());

        trace!(connection = %connection_id, route = %session.route_id(), "Session stored");
        replaced
    }

    /// Get a copy of the session for a connection.
    #[must_use]
    pub fn get(&self, connection_id: &str) -> Option<Session> {
        self.inner.read().sessions.get(connection_id).cloned()
    }

    /// Check whether a connection has a session.
    #[must_use]
    pub fn contains(&self, connection_id: &str) -> bool {
        self.inner.read().sessions.contains_key(connection_id)
    }

    /// Remove and return the session for a connection.
    pub fn remove(&self, connection_id: &str) -> Option<Session> {
        let mut inner = self.inner.write();
        let session = inner.sessions.remove(connection_id)?;
        inner.unindex(session.route_id(), connection_id);
        trace!(connection = %connection_id, route = %session.route_id(), "Session removed");
        Some(session)
    }

    /// Mutate a session in place.
    ///
    /// Returns `None` if the connection has no session.
    pub fn update<R>(&self, connection_id: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut inner = self.inner.write();
        inner.sessions.get_mut(connection_id).map(f)
    }

    /// All sessions on a route, oldest first.
    #[must_use]
    pub fn list_by_route(&self, route_id: &str) -> Vec<Session> {
        let inner = self.inner.read();
        let mut sessions: Vec<Session> = inner
            .by_route
            .get(route_id)
            .map(|connections| {
                connections
                    .iter()
                    .filter_map(|c| inner.sessions.get(c).cloned())
                    .collect()
            })
            .unwrap_or_default();
        drop(inner);

        sessions.sort_by(|a, b| {
            a.started_at()
                .cmp(&b.started_at())
                .then_with(|| a.connection_id().cmp(b.connection_id()))
        });
        sessions
    }

    /// Number of active sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    /// Check if no operator is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().sessions.is_empty()
    }

    /// Number of routes with at least one live operator.
    #[must_use]
    pub fn route_count(&self) -> usize {
        self.inner.read().by_route.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::LatLng;

    fn session(conn: &str, operator: &str, route: &str) -> Session {
        Session::new(conn, operator, route, format!("bus-{operator}"))
    }

    #[test]
    fn test_put_get_remove() {
        let registry = SessionRegistry::new();
        assert!(registry.is_empty());

        assert!(registry.put("conn-1", session("conn-1", "A", "7")).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("conn-1").unwrap().operator_id(), "A");

        let removed = registry.remove("conn-1").unwrap();
        assert_eq!(removed.route_id(), "7");
        assert!(registry.get("conn-1").is_none());
        assert!(registry.remove("conn-1").is_none());
        assert_eq!(registry.route_count(), 0);
    }

    #[test]
    fn test_list_by_route() {
        let registry = SessionRegistry::new();
        registry.put("conn-1", session("conn-1", "A", "7"));
        registry.put("conn-2", session("conn-2", "B", "7"));
        registry.put("conn-3", session("conn-3", "C", "12"));

        let on_seven: Vec<String> = registry
            .list_by_route("7")
            .iter()
            .map(|s| s.operator_id().to_string())
            .collect();
        assert_eq!(on_seven.len(), 2);
        assert!(on_seven.contains(&"A".to_string()));
        assert!(on_seven.contains(&"B".to_string()));

        assert_eq!(registry.list_by_route("12").len(), 1);
        assert!(registry.list_by_route("99").is_empty());
    }

    #[test]
    fn test_put_replacing_reindexes_route() {
        let registry = SessionRegistry::new();
        registry.put("conn-1", session("conn-1", "A", "7"));
        let replaced = registry.put("conn-1", session("conn-1", "A", "12"));

        assert_eq!(replaced.unwrap().route_id(), "7");
        assert!(registry.list_by_route("7").is_empty());
        assert_eq!(registry.list_by_route("12").len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_update_in_place() {
        let registry = SessionRegistry::new();
        registry.put("conn-1", session("conn-1", "A", "7"));

        let route = registry.update("conn-1", |s| {
            s.record_position(LatLng::new(1.5, 2.5), 42);
            s.route_id().to_string()
        });
        assert_eq!(route.as_deref(), Some("7"));
        assert_eq!(
            registry.get("conn-1").unwrap().position(),
            Some(LatLng::new(1.5, 2.5))
        );

        assert!(registry.update("conn-404", |_| ()).is_none());
    }

    #[test]
    fn test_concurrent_puts() {
        let registry = std::sync::Arc::new(SessionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        let conn = format!("conn-{i}-{j}");
                        registry.put(conn.clone(), session(&conn, "op", "7"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 400);
        assert_eq!(registry.list_by_route("7").len(), 400);
    }
}
