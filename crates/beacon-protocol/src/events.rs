//! Event types for the Beacon protocol.
//!
//! Every message on the real-time channel is an event envelope of the form
//! `{"event": "<name>", "data": <payload>}`. Client events drive the relay,
//! server events are what the relay sends back to drivers and passengers.

use serde::{Deserialize, Serialize};

/// Events sent by a client (operator app or passenger app) to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// An operator starts broadcasting on a route.
    #[serde(rename_all = "camelCase")]
    StartDuty {
        /// Operator (driver) identifier.
        operator_id: String,
        /// Route the operator is driving.
        route_id: String,
        /// Vehicle the operator is driving.
        vehicle_id: String,
    },

    /// A position report from a broadcasting operator.
    LocationUpdate(LocationUpdate),

    /// An operator ends duty.
    #[serde(rename_all = "camelCase")]
    EndDuty {
        /// Operator (driver) identifier.
        operator_id: String,
        /// Route the operator was driving.
        route_id: String,
    },

    /// A passenger starts watching a route.
    #[serde(rename_all = "camelCase")]
    SubscribeRoute {
        /// Route to watch.
        route_id: String,
    },

    /// A passenger stops watching a route.
    #[serde(rename_all = "camelCase")]
    UnsubscribeRoute {
        /// Route to stop watching.
        route_id: String,
    },

    /// Application-level keepalive.
    Ping {
        /// Optional client timestamp, echoed in the pong.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

/// A raw position report as sent by the operator app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    /// Operator (driver) identifier.
    pub operator_id: String,
    /// Route the operator claims to be on.
    pub route_id: String,
    /// Vehicle identifier, if the app knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<String>,
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
    /// Heading in degrees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    /// Whether the vehicle is full.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_full: Option<bool>,
    /// Client clock, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Events sent by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Connection established.
    #[serde(rename_all = "camelCase")]
    Connected {
        /// Relay-assigned connection identifier.
        connection_id: String,
        /// Protocol major version.
        version: u8,
        /// Heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// An operator started broadcasting on the route.
    #[serde(rename_all = "camelCase")]
    OperatorOnline {
        operator_id: String,
        route_id: String,
        vehicle_id: String,
    },

    /// A vehicle moved.
    PositionChanged(PositionChanged),

    /// An operator stopped broadcasting on the route.
    #[serde(rename_all = "camelCase")]
    OperatorOffline { operator_id: String, route_id: String },

    /// Operators live on a route at the time a subscriber joined.
    RouteSnapshot(Vec<SnapshotEntry>),

    /// Reply to a client ping.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

/// Broadcast payload for a position update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionChanged {
    pub route_id: String,
    pub operator_id: String,
    pub lat: f64,
    pub lng: f64,
    pub heading: f64,
    pub is_full: bool,
    /// Client clock of the originating report.
    pub timestamp: u64,
}

/// One live operator in a route snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub operator_id: String,
    pub route_id: String,
    pub vehicle_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
}

impl ClientEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::StartDuty { .. } => "start-duty",
            ClientEvent::LocationUpdate(_) => "location-update",
            ClientEvent::EndDuty { .. } => "end-duty",
            ClientEvent::SubscribeRoute { .. } => "subscribe-route",
            ClientEvent::UnsubscribeRoute { .. } => "unsubscribe-route",
            ClientEvent::Ping { .. } => "ping",
        }
    }
}

impl ServerEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::OperatorOnline { .. } => "operator-online",
            ServerEvent::PositionChanged(_) => "position-changed",
            ServerEvent::OperatorOffline { .. } => "operator-offline",
            ServerEvent::RouteSnapshot(_) => "route-snapshot",
            ServerEvent::Pong { .. } => "pong",
        }
    }

    /// Create a new Connected event.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        ServerEvent::Connected {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        }
    }

    /// Create a new OperatorOnline event.
    #[must_use]
    pub fn operator_online(
        operator_id: impl Into<String>,
        route_id: impl Into<String>,
        vehicle_id: impl Into<String>,
    ) -> Self {
        ServerEvent::OperatorOnline {
            operator_id: operator_id.into(),
            route_id: route_id.into(),
            vehicle_id: vehicle_id.into(),
        }
    }

    /// Create a new OperatorOffline event.
    #[must_use]
    pub fn operator_offline(operator_id: impl Into<String>, route_id: impl Into<String>) -> Self {
        ServerEvent::OperatorOffline {
            operator_id: operator_id.into(),
            route_id: route_id.into(),
        }
    }

    /// Create a new Pong event.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        ServerEvent::Pong { timestamp }
    }
}
