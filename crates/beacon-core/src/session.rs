//! Broadcasting sessions.
//!
//! A session exists for exactly as long as an operator is on duty over a
//! given connection.

use crate::routes::LatLng;
use beacon_protocol::SnapshotEntry;
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque identifier of a live connection.
pub type ConnectionId = String;

/// A route identifier (route number).
pub type RouteId = String;

/// Milliseconds since the Unix epoch on the relay's clock.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// One currently broadcasting operator.
///
/// The route is fixed at creation: ending duty and starting again creates a
/// new session.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    connection_id: ConnectionId,
    operator_id: String,
    route_id: RouteId,
    vehicle_id: String,
    position: Option<LatLng>,
    reported_at: Option<u64>,
    started_at: u64,
}

impl Session {
    /// Create a session with no reported position.
    #[must_use]
    pub fn new(
        connection_id: impl Into<ConnectionId>,
        operator_id: impl Into<String>,
        route_id: impl Into<RouteId>,
        vehicle_id: impl Into<String>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            operator_id: operator_id.into(),
            route_id: route_id.into(),
            vehicle_id: vehicle_id.into(),
            position: None,
            reported_at: None,
            started_at: now_millis(),
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    #[must_use]
    pub fn operator_id(&self) -> &str {
        &self.operator_id
    }

    #[must_use]
    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    #[must_use]
    pub fn vehicle_id(&self) -> &str {
        &self.vehicle_id
    }

    /// Last reported position, if any report arrived yet.
    #[must_use]
    pub fn position(&self) -> Option<LatLng> {
        self.position
    }

    /// Client timestamp of the last report.
    #[must_use]
    pub fn reported_at(&self) -> Option<u64> {
        self.reported_at
    }

    /// Relay time the session was created.
    #[must_use]
    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    /// Record a position report in place.
    pub fn record_position(&mut self, position: LatLng, timestamp: u64) {
        self.position = Some(position);
        self.reported_at = Some(timestamp);
    }

    /// The entry a new route subscriber sees for this session.
    #[must_use]
    pub fn snapshot_entry(&self) -> SnapshotEntry {
        SnapshotEntry {
            operator_id: self.operator_id.clone(),
            route_id: self.route_id.clone(),
            vehicle_id: self.vehicle_id.clone(),
            lat: self.position.map(|p| p.lat),
            lng: self.position.map(|p| p.lng),
        }
    }
}
