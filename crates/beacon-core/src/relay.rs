//! The relay: registry, router and store writer behind one event gate.
//!
//! Every inbound connection event runs to completion under the gate, so the
//! registry change, the membership change and the resulting publish of one
//! event never interleave with those of another. Nothing under the gate
//! waits on I/O.

use crate::duty::{DutyCommand, Transition};
use crate::ingest::{IngestOutcome, PositionReport};
use crate::registry::SessionRegistry;
use crate::router::{RouterConfig, RouterError, TopicRouter};
use crate::topic::Inbox;
use crate::writer::StoreWriter;
use beacon_protocol::{ClientEvent, ServerEvent, SnapshotEntry};
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Topic router settings.
    pub router: RouterConfig,
    /// Events buffered per connection before new ones are dropped.
    pub outbox_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            outbox_capacity: 256,
        }
    }
}

/// What handling one client event amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum Handled {
    /// A duty command went through the state machine.
    Duty(Transition),
    /// A position report went through the ingest pipeline.
    Ingest(IngestOutcome),
    /// The connection joined a route; `snapshot` operators were sent to it.
    Subscribed { route_id: String, snapshot: usize },
    /// The connection left a route.
    Unsubscribed { route_id: String, was_member: bool },
    /// The route subscription was refused.
    Rejected(RouterError),
    /// A ping was answered.
    Pong,
}

/// The real-time relay.
pub struct Relay {
    pub(crate) registry: SessionRegistry,
    pub(crate) router: TopicRouter,
    pub(crate) writer: StoreWriter,
    gate: Mutex<()>,
    outbox_capacity: usize,
}

impl Relay {
    /// Create a relay writing durable side effects through `writer`.
    #[must_use]
    pub fn new(config: RelayConfig, writer: StoreWriter) -> Self {
        Self {
            registry: SessionRegistry::new(),
            router: TopicRouter::with_config(config.router),
            writer,
            gate: Mutex::new(()),
            outbox_capacity: config.outbox_capacity.max(1),
        }
    }

    pub(crate) fn turn(&self) -> MutexGuard<'_, ()> {
        self.gate.lock()
    }

    /// The session registry.
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// The topic router.
    #[must_use]
    pub fn router(&self) -> &TopicRouter {
        &self.router
    }

    /// The durable store writer.
    #[must_use]
    pub fn writer(&self) -> &StoreWriter {
        &self.writer
    }

    /// Number of operators currently broadcasting.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Open a connection and return the queue its events arrive on.
    pub fn connect(&self, connection_id: &str) -> Inbox {
        let (tx, rx) = mpsc::channel(self.outbox_capacity);
        self.router.attach(connection_id, tx);
        rx
    }

    /// Close a connection.
    ///
    /// A broadcasting operator goes off duty exactly as if it had sent
    /// end-duty; every topic membership is dropped.
    pub fn disconnect(&self, connection_id: &str) -> Transition {
        let transition = self.apply(connection_id, DutyCommand::ConnectionClosed);
        let _turn = self.turn();
        self.router.detach(connection_id);
        debug!(connection = %connection_id, "Connection closed");
        transition
    }

    /// Dispatch one client event.
    pub fn handle(&self, connection_id: &str, event: ClientEvent) -> Handled {
        trace!(connection = %connection_id, event = event.name(), "Handling event");
        match event {
            ClientEvent::StartDuty {
                operator_id,
                route_id,
                vehicle_id,
            } => Handled::Duty(self.apply(
                connection_id,
                DutyCommand::StartDuty {
                    operator_id,
                    route_id,
                    vehicle_id,
                },
            )),
            ClientEvent::EndDuty {
                operator_id,
                route_id,
            } => Handled::Duty(self.apply(
                connection_id,
                DutyCommand::EndDuty {
                    operator_id,
                    route_id,
                },
            )),
            ClientEvent::LocationUpdate(update) => {
                Handled::Ingest(self.ingest(connection_id, PositionReport::from(update)))
            }
            ClientEvent::SubscribeRoute { route_id } => {
                match self.subscribe_route(connection_id, &route_id) {
                    Ok(snapshot) => Handled::Subscribed { route_id, snapshot },
                    Err(e) => Handled::Rejected(e),
                }
            }
            ClientEvent::UnsubscribeRoute { route_id } => {
                let was_member = self.unsubscribe_route(connection_id, &route_id);
                Handled::Unsubscribed {
                    route_id,
                    was_member,
                }
            }
            ClientEvent::Ping { timestamp } => {
                self.router.send_to(connection_id, ServerEvent::pong(timestamp));
                Handled::Pong
            }
        }
    }

    /// Join a route topic and send the joining connection a snapshot of the
    /// operators currently live on it.
    ///
    /// Returns the number of operators in the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the router refuses the subscription.
    pub fn subscribe_route(&self, connection_id: &str, route_id: &str) -> Result<usize, RouterError> {
        let _turn = self.turn();
        self.router.subscribe(connection_id, route_id)?;
        let snapshot = self.snapshot(route_id);
        let count = snapshot.len();
        self.router
            .send_to(connection_id, ServerEvent::RouteSnapshot(snapshot));
        debug!(connection = %connection_id, route = %route_id, live = count, "Route subscribed");
        Ok(count)
    }

    /// Leave a route topic.
    pub fn unsubscribe_route(&self, connection_id: &str, route_id: &str) -> bool {
        let _turn = self.turn();
        self.router.unsubscribe(connection_id, route_id)
    }

    /// Operators live on a route right now.
    #[must_use]
    pub fn snapshot(&self, route_id: &str) -> Vec<SnapshotEntry> {
        self.registry
            .list_by_route(route_id)
            .iter()
            .map(|s| s.snapshot_entry())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn relay() -> Relay {
        let writer = StoreWriter::spawn(Arc::new(MemoryStore::new()), 64);
        Relay::new(RelayConfig::default(), writer)
    }

    #[tokio::test]
    async fn test_subscribe_sends_empty_snapshot() {
        let relay = relay();
        let mut inbox = relay.connect("passenger");

        let handled = relay.handle(
            "passenger",
            ClientEvent::SubscribeRoute {
                route_id: "7".into(),
            },
        );
        assert_eq!(
            handled,
            Handled::Subscribed {
                route_id: "7".into(),
                snapshot: 0
            }
        );
        assert_eq!(*inbox.try_recv().unwrap(), ServerEvent::RouteSnapshot(vec![]));
    }

    #[tokio::test]
    async fn test_subscribe_invalid_route_rejected() {
        let relay = relay();
        let mut inbox = relay.connect("passenger");

        let handled = relay.handle(
            "passenger",
            ClientEvent::SubscribeRoute {
                route_id: String::new(),
            },
        );
        assert!(matches!(handled, Handled::Rejected(RouterError::InvalidRoute(_))));
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_route() {
        let relay = relay();
        let _inbox = relay.connect("passenger");
        relay.subscribe_route("passenger", "7").unwrap();

        assert!(relay.unsubscribe_route("passenger", "7"));
        assert!(!relay.router().is_subscribed("passenger", "7"));
        assert!(!relay.unsubscribe_route("passenger", "7"));
    }

    #[tokio::test]
    async fn test_ping_answers_pong() {
        let relay = relay();
        let mut inbox = relay.connect("conn-1");

        assert_eq!(
            relay.handle("conn-1", ClientEvent::Ping { timestamp: Some(9) }),
            Handled::Pong
        );
        assert_eq!(*inbox.try_recv().unwrap(), ServerEvent::pong(Some(9)));
    }

    #[tokio::test]
    async fn test_disconnect_passenger_leaves_all_topics() {
        let relay = relay();
        let _inbox = relay.connect("passenger");
        relay.subscribe_route("passenger", "7").unwrap();
        relay.subscribe_route("passenger", "12").unwrap();

        assert_eq!(relay.disconnect("passenger"), Transition::Ignored);
        assert_eq!(relay.router().subscriber_count("7"), 0);
        assert_eq!(relay.router().subscriber_count("12"), 0);
        assert_eq!(relay.router().stats().connection_count, 0);
    }
}
