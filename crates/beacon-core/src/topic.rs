//! Route topics.
//!
//! A topic is the set of connections watching one route. Members are held
//! together with their outbox so a publish never has to look anywhere else.

use beacon_protocol::ServerEvent;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

use crate::session::{ConnectionId, RouteId};

/// Maximum route id length.
pub const MAX_ROUTE_ID_LENGTH: usize = 64;

/// Sending half of a connection's delivery queue.
pub type Outbox = mpsc::Sender<Arc<ServerEvent>>;

/// Receiving half of a connection's delivery queue.
pub type Inbox = mpsc::Receiver<Arc<ServerEvent>>;

/// Validate a route id.
///
/// # Errors
///
/// Returns an error message if the route id is invalid.
pub fn validate_route_id(route_id: &str) -> Result<(), &'static str> {
    if route_id.is_empty() {
        return Err("Route id cannot be empty");
    }
    if route_id.len() > MAX_ROUTE_ID_LENGTH {
        return Err("Route id too long");
    }
    if !route_id.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Route id contains invalid characters");
    }
    Ok(())
}

/// Result of handing one event to one outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The outbox is full; the event was skipped for this member.
    Full,
    /// The connection is going away.
    Closed,
}

/// Try to place an event in an outbox without waiting.
pub fn deliver(connection_id: &str, outbox: &Outbox, event: Arc<ServerEvent>) -> Delivery {
    match outbox.try_send(event) {
        Ok(()) => Delivery::Delivered,
        Err(TrySendError::Full(event)) => {
            warn!(connection = %connection_id, event = event.name(), "Outbox full, event dropped");
            Delivery::Full
        }
        Err(TrySendError::Closed(_)) => {
            debug!(connection = %connection_id, "Outbox closed");
            Delivery::Closed
        }
    }
}

/// Outcome of a fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub dropped: usize,
}

/// Subscribers of one route.
#[derive(Debug)]
pub struct Topic {
    route_id: RouteId,
    members: HashMap<ConnectionId, Outbox>,
}

impl Topic {
    /// Create an empty topic.
    #[must_use]
    pub fn new(route_id: impl Into<RouteId>) -> Self {
        Self {
            route_id: route_id.into(),
            members: HashMap::new(),
        }
    }

    #[must_use]
    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_member(&self, connection_id: &str) -> bool {
        self.members.contains_key(connection_id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Add a member. Returns `false` if it was already a member.
    pub fn join(&mut self, connection_id: impl Into<ConnectionId>, outbox: Outbox) -> bool {
        let connection_id = connection_id.into();
        if self.members.contains_key(&connection_id) {
            return false;
        }
        debug!(route = %self.route_id, connection = %connection_id, "Joined topic");
        self.members.insert(connection_id, outbox);
        true
    }

    /// Remove a member. Returns `true` if it was a member.
    pub fn leave(&mut self, connection_id: &str) -> bool {
        let removed = self.members.remove(connection_id).is_some();
        if removed {
            debug!(route = %self.route_id, connection = %connection_id, "Left topic");
        }
        removed
    }

    /// Hand an event to every member except `except`.
    ///
    /// A member that cannot take the event is skipped; the rest still get it.
    pub fn broadcast(&self, event: &Arc<ServerEvent>, except: Option<&str>) -> FanOut {
        let mut fan_out = FanOut::default();
        for (connection_id, outbox) in &self.members {
            if except == Some(connection_id.as_str()) {
                continue;
            }
            match deliver(connection_id, outbox, Arc::clone(event)) {
                Delivery::Delivered => fan_out.delivered += 1,
                Delivery::Full | Delivery::Closed => fan_out.dropped += 1,
            }
        }
        trace!(
            route = %self.route_id,
            event = event.name(),
            delivered = fan_out.delivered,
            dropped = fan_out.dropped,
            "Broadcast"
        );
        fan_out
    }

    /// Member connection ids.
    #[must_use]
    pub fn members(&self) -> Vec<ConnectionId> {
        self.members.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> Arc<ServerEvent> {
        Arc::new(ServerEvent::operator_offline("X", "7"))
    }

    #[test]
    fn test_join_leave() {
        let mut topic = Topic::new("7");
        let (tx, _rx) = mpsc::channel(4);

        assert!(topic.join("conn-1", tx.clone()));
        assert!(!topic.join("conn-1", tx));
        assert_eq!(topic.member_count(), 1);
        assert!(topic.is_member("conn-1"));

        assert!(topic.leave("conn-1"));
        assert!(!topic.leave("conn-1"));
        assert!(topic.is_empty());
    }

    #[test]
    fn test_broadcast_skips_except() {
        let mut topic = Topic::new("7");
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        topic.join("conn-1", tx1);
        topic.join("conn-2", tx2);

        let fan_out = topic.broadcast(&event(), Some("conn-1"));
        assert_eq!(fan_out, FanOut { delivered: 1, dropped: 0 });
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_broadcast_survives_failing_member() {
        let mut topic = Topic::new("7");
        let (full_tx, _full_rx) = mpsc::channel(1);
        let (closed_tx, closed_rx) = mpsc::channel(1);
        let (ok_tx, mut ok_rx) = mpsc::channel(4);
        full_tx.try_send(event()).unwrap();
        drop(closed_rx);

        topic.join("full", full_tx);
        topic.join("closed", closed_tx);
        topic.join("ok", ok_tx);

        let fan_out = topic.broadcast(&event(), None);
        assert_eq!(fan_out, FanOut { delivered: 1, dropped: 2 });
        assert!(ok_rx.try_recv().is_ok());
    }

    #[test]
    fn test_route_id_validation() {
        assert!(validate_route_id("7").is_ok());
        assert!(validate_route_id("12A-express").is_ok());
        assert!(validate_route_id("").is_err());
        assert!(validate_route_id("bad\nroute").is_err());
        assert!(validate_route_id(&"9".repeat(MAX_ROUTE_ID_LENGTH + 1)).is_err());
    }
}
