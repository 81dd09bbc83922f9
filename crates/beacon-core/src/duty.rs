//! Operator duty state machine.
//!
//! Each operator is either idle or broadcasting; broadcasting means a
//! session exists for its connection. Explicit end-duty and a dropped
//! connection are the same transition, fed through [`Relay::apply`], so both
//! leave the durable store in the same state.

use crate::relay::Relay;
use crate::session::{now_millis, Session};
use crate::store::{OperatorStatus, VehicleUpdate};
use crate::topic::validate_route_id;
use crate::writer::StatusWrite;
use beacon_protocol::ServerEvent;
use tracing::{debug, info, warn};

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DutyCommand {
    /// The operator app starts broadcasting.
    StartDuty {
        operator_id: String,
        route_id: String,
        vehicle_id: String,
    },
    /// The operator app ends duty.
    EndDuty { operator_id: String, route_id: String },
    /// The transport reported the connection closed.
    ConnectionClosed,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndCause {
    EndDuty,
    ConnectionLost,
}

/// Outcome of applying a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Idle -> Broadcasting.
    Started(Session),
    /// Start requested while a session already exists; it is kept as is.
    AlreadyBroadcasting(Session),
    /// Broadcasting -> Idle.
    Ended { session: Session, cause: EndCause },
    /// End-duty without a session; the operator is still recorded offline.
    MarkedOffline { operator_id: String },
    /// Nothing to do (malformed command, or closing an idle connection).
    Ignored,
}

impl Relay {
    /// Apply a duty command for a connection.
    pub fn apply(&self, connection_id: &str, command: DutyCommand) -> Transition {
        match command {
            DutyCommand::StartDuty {
                operator_id,
                route_id,
                vehicle_id,
            } => self.start_duty(connection_id, operator_id, route_id, vehicle_id),
            DutyCommand::EndDuty {
                operator_id,
                route_id,
            } => self.end_duty(connection_id, EndCause::EndDuty, Some((operator_id, route_id))),
            DutyCommand::ConnectionClosed => {
                self.end_duty(connection_id, EndCause::ConnectionLost, None)
            }
        }
    }

    fn start_duty(
        &self,
        connection_id: &str,
        operator_id: String,
        route_id: String,
        vehicle_id: String,
    ) -> Transition {
        if operator_id.is_empty() || vehicle_id.is_empty() || validate_route_id(&route_id).is_err() {
            debug!(connection = %connection_id, "Malformed start-duty dropped");
            return Transition::Ignored;
        }

        let _turn = self.turn();

        if let Some(existing) = self.registry.get(connection_id) {
            debug!(
                connection = %connection_id,
                operator = %existing.operator_id(),
                route = %existing.route_id(),
                "Start-duty while broadcasting, keeping session"
            );
            return Transition::AlreadyBroadcasting(existing);
        }

        let session = Session::new(connection_id, &operator_id, &route_id, &vehicle_id);
        self.registry.put(connection_id, session.clone());

        if let Err(e) = self.router.subscribe(connection_id, &route_id) {
            warn!(connection = %connection_id, route = %route_id, error = %e, "Operator could not join route topic");
        }
        self.router.publish_except(
            &route_id,
            connection_id,
            ServerEvent::operator_online(&operator_id, &route_id, &vehicle_id),
        );

        // Queued under the gate so durable writes keep the order of transitions.
        let at = now_millis();
        self.writer.enqueue(StatusWrite::Operator {
            operator_id: operator_id.clone(),
            status: OperatorStatus::OnDuty,
            at,
        });
        self.writer.enqueue(StatusWrite::Vehicle {
            vehicle_id,
            update: VehicleUpdate::liveness(true, at),
        });

        info!(connection = %connection_id, operator = %operator_id, route = %route_id, "Operator started duty");
        Transition::Started(session)
    }

    fn end_duty(
        &self,
        connection_id: &str,
        cause: EndCause,
        claimed: Option<(String, String)>,
    ) -> Transition {
        let _turn = self.turn();
        let at = now_millis();

        let Some(session) = self.registry.remove(connection_id) else {
            return match claimed {
                Some((operator_id, route_id)) if !operator_id.is_empty() => {
                    debug!(
                        connection = %connection_id,
                        operator = %operator_id,
                        route = %route_id,
                        "End-duty without session, recording operator offline"
                    );
                    self.writer.enqueue(StatusWrite::Operator {
                        operator_id: operator_id.clone(),
                        status: OperatorStatus::Offline,
                        at,
                    });
                    Transition::MarkedOffline { operator_id }
                }
                _ => Transition::Ignored,
            };
        };

        self.router.unsubscribe_all(connection_id);
        self.router.publish(
            session.route_id(),
            ServerEvent::operator_offline(session.operator_id(), session.route_id()),
        );

        if let Some((operator_id, route_id)) = &claimed {
            if operator_id != session.operator_id() || route_id != session.route_id() {
                debug!(
                    connection = %connection_id,
                    claimed_operator = %operator_id,
                    claimed_route = %route_id,
                    "End-duty payload differs from session, using session"
                );
            }
        }

        self.writer.enqueue(StatusWrite::Operator {
            operator_id: session.operator_id().to_string(),
            status: OperatorStatus::Offline,
            at,
        });
        self.writer.enqueue(StatusWrite::Vehicle {
            vehicle_id: session.vehicle_id().to_string(),
            update: VehicleUpdate::liveness(false, at),
        });

        match cause {
            EndCause::EndDuty => {
                info!(connection = %connection_id, operator = %session.operator_id(), route = %session.route_id(), "Operator ended duty");
            }
            EndCause::ConnectionLost => {
                warn!(connection = %connection_id, operator = %session.operator_id(), route = %session.route_id(), "Operator disconnected while on duty");
            }
        }
        Transition::Ended { session, cause }
    }
}
