//! Position ingest and broadcast.
//!
//! A report from a broadcasting connection updates its session, is fanned
//! out to the session's route topic, and is persisted in the background.
//! Reports from connections without a session are dropped.

use crate::relay::Relay;
use crate::routes::LatLng;
use crate::session::now_millis;
use crate::store::VehicleUpdate;
use crate::writer::StatusWrite;
use beacon_protocol::{LocationUpdate, PositionChanged, ServerEvent};
use tracing::{debug, trace};

/// A position report, normalized from the wire form.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionReport {
    pub operator_id: String,
    pub route_id: String,
    pub vehicle_id: Option<String>,
    pub position: LatLng,
    /// Degrees; 0 when the client sent none.
    pub heading: f64,
    /// False when the client sent none.
    pub is_full: bool,
    /// Client clock.
    pub timestamp: u64,
}

impl From<LocationUpdate> for PositionReport {
    fn from(update: LocationUpdate) -> Self {
        Self {
            operator_id: update.operator_id,
            route_id: update.route_id,
            vehicle_id: update.vehicle_id.filter(|v| !v.is_empty()),
            position: LatLng::new(update.lat, update.lng),
            heading: update.heading.unwrap_or(0.0),
            is_full: update.is_full.unwrap_or(false),
            timestamp: update.timestamp,
        }
    }
}

impl PositionReport {
    /// Reject reports that cannot be broadcast.
    ///
    /// # Errors
    ///
    /// Returns a short reason when an id is empty or a coordinate is not a
    /// finite number.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.operator_id.is_empty() {
            return Err("operator id is empty");
        }
        if self.route_id.is_empty() {
            return Err("route id is empty");
        }
        if !self.position.is_finite() {
            return Err("coordinates are not finite");
        }
        if !self.heading.is_finite() {
            return Err("heading is not finite");
        }
        Ok(())
    }
}

/// Result of ingesting one report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Published to the route; `recipients` members received it.
    Broadcast { route_id: String, recipients: usize },
    /// The connection is not broadcasting; the report was dropped.
    NoSession,
    /// The report failed validation and was dropped.
    Malformed(&'static str),
}

impl Relay {
    /// Ingest a position report from a connection.
    ///
    /// The broadcast goes to the route of the connection's session under the
    /// session's operator id, and the position is stored on the session's
    /// vehicle, whatever the report claims.
    pub fn ingest(&self, connection_id: &str, report: PositionReport) -> IngestOutcome {
        if let Err(reason) = report.validate() {
            debug!(connection = %connection_id, reason, "Malformed position report dropped");
            return IngestOutcome::Malformed(reason);
        }

        let _turn = self.turn();

        let Some((operator_id, route_id, vehicle_id)) =
            self.registry.update(connection_id, |session| {
                session.record_position(report.position, report.timestamp);
                (
                    session.operator_id().to_string(),
                    session.route_id().to_string(),
                    session.vehicle_id().to_string(),
                )
            })
        else {
            trace!(connection = %connection_id, "Position report without session dropped");
            return IngestOutcome::NoSession;
        };

        let claimed_vehicle = report.vehicle_id.as_deref().unwrap_or(&vehicle_id);
        if operator_id != report.operator_id
            || route_id != report.route_id
            || claimed_vehicle != vehicle_id
        {
            trace!(
                connection = %connection_id,
                claimed_operator = %report.operator_id,
                claimed_route = %report.route_id,
                claimed_vehicle = %claimed_vehicle,
                "Position report identity differs from session"
            );
        }

        let recipients = self.router.publish(
            &route_id,
            ServerEvent::PositionChanged(PositionChanged {
                route_id: route_id.clone(),
                operator_id,
                lat: report.position.lat,
                lng: report.position.lng,
                heading: report.heading,
                is_full: report.is_full,
                timestamp: report.timestamp,
            }),
        );

        // Only the session's vehicle is marked live, so ending the session
        // clears everything this report touched.
        self.writer.enqueue(StatusWrite::Vehicle {
            vehicle_id,
            update: VehicleUpdate::position(report.position, report.heading, report.is_full, now_millis()),
        });

        IngestOutcome::Broadcast {
            route_id,
            recipients,
        }
    }
}
