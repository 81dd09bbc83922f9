//! Route topic router.
//!
//! The router owns topic membership and fans route events out to the
//! connections watching each route.

use crate::session::{ConnectionId, RouteId};
use crate::topic::{deliver, validate_route_id, Delivery, FanOut, Outbox, Topic};
use beacon_protocol::ServerEvent;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace};

/// Router errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouterError {
    /// Invalid route id.
    #[error("Invalid route id: {0}")]
    InvalidRoute(&'static str),

    /// The connection has no outbox attached.
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// Maximum subscriptions reached.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum topics a single connection may belong to.
    pub max_subscriptions_per_connection: usize,
    /// Whether to drop a topic once its last member leaves.
    pub prune_empty_topics: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_subscriptions_per_connection: 16,
            prune_empty_topics: false,
        }
    }
}

/// Routes events to route topics.
///
/// Membership of each connection is indexed separately so that
/// [`TopicRouter::unsubscribe_all`] can clean up without the caller knowing
/// which routes the connection joined.
pub struct TopicRouter {
    /// Topics indexed by route id.
    topics: DashMap<RouteId, Topic>,
    /// Connection memberships (connection id -> route ids).
    memberships: DashMap<ConnectionId, HashSet<RouteId>>,
    /// Delivery queues of attached connections.
    outboxes: DashMap<ConnectionId, Outbox>,
    /// Events skipped because an outbox was full or closed.
    dropped: AtomicU64,
    config: RouterConfig,
}

impl TopicRouter {
    /// Create a new router with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    /// Create a new router with custom configuration.
    #[must_use]
    pub fn with_config(config: RouterConfig) -> Self {
        info!("Creating topic router with config: {:?}", config);
        Self {
            topics: DashMap::new(),
            memberships: DashMap::new(),
            outboxes: DashMap::new(),
            dropped: AtomicU64::new(0),
            config,
        }
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            topic_count: self.topics.len(),
            connection_count: self.outboxes.len(),
            total_subscriptions: self.memberships.iter().map(|m| m.len()).sum(),
            dropped_deliveries: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Register the delivery queue of a new connection.
    pub fn attach(&self, connection_id: impl Into<ConnectionId>, outbox: Outbox) {
        let connection_id = connection_id.into();
        debug!(connection = %connection_id, "Connection attached");
        self.outboxes.insert(connection_id, outbox);
    }

    /// Forget a connection: leave every topic and drop its outbox.
    ///
    /// Returns the routes it was removed from.
    pub fn detach(&self, connection_id: &str) -> Vec<RouteId> {
        let left = self.unsubscribe_all(connection_id);
        self.outboxes.remove(connection_id);
        debug!(connection = %connection_id, "Connection detached");
        left
    }

    /// Subscribe a connection to a route topic, creating the topic if needed.
    ///
    /// Returns `false` if the connection was already a member.
    ///
    /// # Errors
    ///
    /// Returns an error if the route id is invalid, the connection is not
    /// attached, or its subscription limit is reached.
    pub fn subscribe(&self, connection_id: &str, route_id: &str) -> Result<bool, RouterError> {
        validate_route_id(route_id).map_err(RouterError::InvalidRoute)?;

        let outbox = self
            .outboxes
            .get(connection_id)
            .map(|o| o.value().clone())
            .ok_or_else(|| RouterError::UnknownConnection(connection_id.to_string()))?;

        let mut routes = self
            .memberships
            .entry(connection_id.to_string())
            .or_default();

        if routes.contains(route_id) {
            return Ok(false);
        }
        if routes.len() >= self.config.max_subscriptions_per_connection {
            return Err(RouterError::MaxSubscriptionsReached);
        }

        let mut topic = self.topics.entry(route_id.to_string()).or_insert_with(|| {
            debug!(route = %route_id, "Creating new topic");
            Topic::new(route_id)
        });
        topic.join(connection_id, outbox);
        routes.insert(route_id.to_string());

        debug!(
            route = %route_id,
            connection = %connection_id,
            members = topic.member_count(),
            "Subscribed"
        );

        Ok(true)
    }

    /// Unsubscribe a connection from a route topic.
    ///
    /// Returns `false` if it was not a member.
    pub fn unsubscribe(&self, connection_id: &str, route_id: &str) -> bool {
        let was_member = self
            .memberships
            .get_mut(connection_id)
            .map(|mut routes| routes.remove(route_id))
            .unwrap_or(false);

        if was_member {
            self.leave_topic(connection_id, route_id);
        }
        was_member
    }

    /// Unsubscribe a connection from every topic it joined.
    ///
    /// Returns the routes it left.
    pub fn unsubscribe_all(&self, connection_id: &str) -> Vec<RouteId> {
        let routes: Vec<RouteId> = self
            .memberships
            .remove(connection_id)
            .map(|(_, routes)| routes.into_iter().collect())
            .unwrap_or_default();

        for route_id in &routes {
            self.leave_topic(connection_id, route_id);
        }

        debug!(connection = %connection_id, topics = routes.len(), "Unsubscribed from all topics");
        routes
    }

    fn leave_topic(&self, connection_id: &str, route_id: &str) {
        if let Some(mut topic) = self.topics.get_mut(route_id) {
            topic.leave(connection_id);

            if self.config.prune_empty_topics && topic.is_empty() {
                drop(topic);
                self.topics.remove_if(route_id, |_, t| t.is_empty());
                debug!(route = %route_id, "Deleted empty topic");
            }
        }
    }

    /// Publish an event to every member of a route topic.
    ///
    /// Returns the number of members that received it. Publishing to a route
    /// nobody watches is a no-op.
    pub fn publish(&self, route_id: &str, event: ServerEvent) -> usize {
        self.fan_out(route_id, event, None).delivered
    }

    /// Publish an event to every member of a route topic except one.
    pub fn publish_except(&self, route_id: &str, except: &str, event: ServerEvent) -> usize {
        self.fan_out(route_id, event, Some(except)).delivered
    }

    fn fan_out(&self, route_id: &str, event: ServerEvent, except: Option<&str>) -> FanOut {
        // Exclusive access keeps every member's view of this route in one order.
        let Some(topic) = self.topics.get_mut(route_id) else {
            trace!(route = %route_id, event = event.name(), "Publish to route without topic");
            return FanOut::default();
        };
        let fan_out = topic.broadcast(&Arc::new(event), except);
        if fan_out.dropped > 0 {
            self.dropped.fetch_add(fan_out.dropped as u64, Ordering::Relaxed);
        }
        fan_out
    }

    /// Deliver an event to a single attached connection.
    pub fn send_to(&self, connection_id: &str, event: ServerEvent) -> bool {
        let Some(outbox) = self.outboxes.get(connection_id).map(|o| o.value().clone()) else {
            trace!(connection = %connection_id, "Send to unattached connection");
            return false;
        };
        match deliver(connection_id, &outbox, Arc::new(event)) {
            Delivery::Delivered => true,
            Delivery::Full | Delivery::Closed => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Check if a topic exists for a route.
    #[must_use]
    pub fn topic_exists(&self, route_id: &str) -> bool {
        self.topics.contains_key(route_id)
    }

    /// Check if a connection is a member of a route topic.
    #[must_use]
    pub fn is_subscribed(&self, connection_id: &str, route_id: &str) -> bool {
        self.topics
            .get(route_id)
            .map(|t| t.is_member(connection_id))
            .unwrap_or(false)
    }

    /// Get the member count of a route topic.
    #[must_use]
    pub fn subscriber_count(&self, route_id: &str) -> usize {
        self.topics
            .get(route_id)
            .map(|t| t.member_count())
            .unwrap_or(0)
    }

    /// Get the routes a connection is subscribed to.
    #[must_use]
    pub fn connection_routes(&self, connection_id: &str) -> Vec<RouteId> {
        self.memberships
            .get(connection_id)
            .map(|routes| routes.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for TopicRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Router statistics.
#[derive(Debug, Clone, Default)]
pub struct RouterStats {
    /// Number of route topics.
    pub topic_count: usize,
    /// Number of attached connections.
    pub connection_count: usize,
    /// Total number of topic memberships.
    pub total_subscriptions: usize,
    /// Events skipped for full or closed outboxes since start.
    pub dropped_deliveries: u64,
}
