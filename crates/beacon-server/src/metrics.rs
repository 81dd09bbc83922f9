//! Metrics collection and export for Beacon.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use beacon_core::{Handled, IngestOutcome, Relay, Transition};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "beacon_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "beacon_connections_active";
    pub const SESSIONS_ACTIVE: &str = "beacon_sessions_active";
    pub const TOPICS_ACTIVE: &str = "beacon_topics_active";
    pub const DUTY_TRANSITIONS_TOTAL: &str = "beacon_duty_transitions_total";
    pub const REPORTS_TOTAL: &str = "beacon_reports_total";
    pub const DELIVERIES_TOTAL: &str = "beacon_deliveries_total";
    pub const DELIVERIES_DROPPED: &str = "beacon_deliveries_dropped_total";
    pub const STORE_WRITES_TOTAL: &str = "beacon_store_writes_total";
    pub const STORE_QUEUE_DEPTH: &str = "beacon_store_queue_depth";
    pub const MESSAGES_TOTAL: &str = "beacon_messages_total";
    pub const MESSAGES_BYTES: &str = "beacon_messages_bytes";
    pub const LATENCY_SECONDS: &str = "beacon_latency_seconds";
    pub const ERRORS_TOTAL: &str = "beacon_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_gauge!(
        names::SESSIONS_ACTIVE,
        "Operators currently broadcasting"
    );
    metrics::describe_gauge!(names::TOPICS_ACTIVE, "Route topics currently held");
    metrics::describe_counter!(
        names::DUTY_TRANSITIONS_TOTAL,
        "Duty state machine outcomes"
    );
    metrics::describe_counter!(names::REPORTS_TOTAL, "Position reports by outcome");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Position events delivered to subscribers"
    );
    metrics::describe_counter!(
        names::DELIVERIES_DROPPED,
        "Events dropped because a subscriber outbox was full or closed"
    );
    metrics::describe_counter!(names::STORE_WRITES_TOTAL, "Durable writes by outcome");
    metrics::describe_gauge!(names::STORE_QUEUE_DEPTH, "Durable writes waiting");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages processed");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound event processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Periodically copy relay-owned counters into the exporter.
pub fn spawn_relay_sampler(relay: Arc<Relay>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            sample_relay(&relay);
        }
    })
}

fn sample_relay(relay: &Relay) {
    let router = relay.router().stats();
    let writer = relay.writer().stats();

    gauge!(names::SESSIONS_ACTIVE).set(relay.active_sessions() as f64);
    gauge!(names::TOPICS_ACTIVE).set(router.topic_count as f64);
    counter!(names::DELIVERIES_DROPPED).absolute(router.dropped_deliveries);
    counter!(names::STORE_WRITES_TOTAL, "outcome" => "applied").absolute(writer.applied);
    counter!(names::STORE_WRITES_TOTAL, "outcome" => "failed").absolute(writer.failed);
    counter!(names::STORE_WRITES_TOTAL, "outcome" => "dropped").absolute(writer.dropped);
    gauge!(names::STORE_QUEUE_DEPTH).set(relay.writer().pending() as f64);
}

/// Record what handling one client event amounted to.
pub fn record_handled(handled: &Handled) {
    match handled {
        Handled::Duty(transition) => {
            let outcome = match transition {
                Transition::Started(_) => "started",
                Transition::AlreadyBroadcasting(_) => "already_broadcasting",
                Transition::Ended { .. } => "ended",
                Transition::MarkedOffline { .. } => "marked_offline",
                Transition::Ignored => "ignored",
            };
            counter!(names::DUTY_TRANSITIONS_TOTAL, "outcome" => outcome).increment(1);
        }
        Handled::Ingest(outcome) => {
            let label = match outcome {
                IngestOutcome::Broadcast { recipients, .. } => {
                    counter!(names::DELIVERIES_TOTAL).increment(*recipients as u64);
                    "broadcast"
                }
                IngestOutcome::NoSession => "no_session",
                IngestOutcome::Malformed(_) => {
                    record_error("malformed_report");
                    "malformed"
                }
            };
            counter!(names::REPORTS_TOTAL, "outcome" => label).increment(1);
        }
        Handled::Rejected(_) => record_error("subscription_rejected"),
        Handled::Subscribed { .. } | Handled::Unsubscribed { .. } | Handled::Pong => {}
    }
}

/// Record a connection loss that ended a duty.
pub fn record_disconnect_transition(transition: &Transition) {
    if matches!(transition, Transition::Ended { .. }) {
        counter!(names::DUTY_TRANSITIONS_TOTAL, "outcome" => "connection_lost").increment(1);
    }
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record inbound event latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
