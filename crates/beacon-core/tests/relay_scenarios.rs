//! End-to-end relay scenarios driven through `Relay::handle`.

use beacon_core::{
    Handled, Inbox, IngestOutcome, MemoryStore, OperatorStatus, Relay, RelayConfig, StoreWriter,
    Transition,
};
use beacon_protocol::{ClientEvent, LocationUpdate, ServerEvent};
use std::sync::Arc;

fn relay() -> (Relay, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let writer = StoreWriter::spawn(store.clone(), 256);
    (Relay::new(RelayConfig::default(), writer), store)
}

fn start_duty(operator: &str, route: &str, vehicle: &str) -> ClientEvent {
    ClientEvent::StartDuty {
        operator_id: operator.into(),
        route_id: route.into(),
        vehicle_id: vehicle.into(),
    }
}

fn location(operator: &str, route: &str, lat: f64, lng: f64, timestamp: u64) -> ClientEvent {
    ClientEvent::LocationUpdate(LocationUpdate {
        operator_id: operator.into(),
        route_id: route.into(),
        vehicle_id: None,
        lat,
        lng,
        heading: None,
        is_full: None,
        timestamp,
    })
}

fn subscribe(route: &str) -> ClientEvent {
    ClientEvent::SubscribeRoute {
        route_id: route.into(),
    }
}

fn drain(inbox: &mut Inbox) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = inbox.try_recv() {
        events.push((*event).clone());
    }
    events
}

#[tokio::test]
async fn operator_broadcasts_then_disconnects() {
    let (relay, store) = relay();
    let _driver = relay.connect("driver");
    let mut passenger = relay.connect("passenger");

    relay.handle("passenger", subscribe("7"));
    relay.handle("driver", start_duty("D-1", "7", "V-1"));
    relay.handle("driver", location("D-1", "7", 24.58, 73.70, 1000));
    relay.disconnect("driver");

    let events = drain(&mut passenger);
    let names: Vec<_> = events.iter().map(ServerEvent::name).collect();
    assert_eq!(
        names,
        ["route-snapshot", "operator-online", "position-changed", "operator-offline"]
    );

    let ServerEvent::PositionChanged(changed) = &events[2] else {
        panic!("expected position-changed, got {:?}", events[2]);
    };
    assert_eq!((changed.lat, changed.lng, changed.timestamp), (24.58, 73.70, 1000));
    assert_eq!(events[3], ServerEvent::operator_offline("D-1", "7"));

    assert!(relay.registry().list_by_route("7").is_empty());

    relay.writer().flush().await;
    assert_eq!(store.operator("D-1").unwrap().status, OperatorStatus::Offline);
    assert!(!store.vehicle("V-1").unwrap().is_live);
}

#[tokio::test]
async fn repeated_start_duty_has_no_side_effects() {
    let (relay, store) = relay();
    let _driver = relay.connect("driver");
    let mut passenger = relay.connect("passenger");
    relay.handle("passenger", subscribe("7"));

    relay.handle("driver", start_duty("D-1", "7", "V-1"));
    relay.writer().flush().await;
    let writes = store.write_count();
    drain(&mut passenger);

    let again = relay.handle("driver", start_duty("D-1", "7", "V-1"));
    assert!(matches!(again, Handled::Duty(Transition::AlreadyBroadcasting(_))));

    relay.writer().flush().await;
    assert_eq!(store.write_count(), writes);
    assert!(drain(&mut passenger).is_empty());
    assert_eq!(relay.registry().list_by_route("7").len(), 1);
}

#[tokio::test]
async fn report_before_start_duty_reaches_nobody() {
    let (relay, store) = relay();
    let _driver = relay.connect("driver");
    let mut passenger = relay.connect("passenger");
    relay.handle("passenger", subscribe("7"));
    drain(&mut passenger);

    let handled = relay.handle("driver", location("D-1", "7", 1.0, 2.0, 5));
    assert_eq!(handled, Handled::Ingest(IngestOutcome::NoSession));
    assert!(drain(&mut passenger).is_empty());

    relay.writer().flush().await;
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn late_subscriber_gets_snapshot_with_last_position() {
    let (relay, _store) = relay();
    let _a = relay.connect("driver-a");
    let _b = relay.connect("driver-b");
    relay.handle("driver-a", start_duty("D-1", "7", "V-1"));
    relay.handle("driver-b", start_duty("D-2", "7", "V-2"));
    relay.handle("driver-a", location("D-1", "7", 24.5, 73.7, 10));

    let mut late = relay.connect("late");
    assert_eq!(
        relay.handle("late", subscribe("7")),
        Handled::Subscribed {
            route_id: "7".into(),
            snapshot: 2
        }
    );

    let events = drain(&mut late);
    assert_eq!(events.len(), 1);
    let ServerEvent::RouteSnapshot(entries) = &events[0] else {
        panic!("expected route-snapshot, got {:?}", events[0]);
    };
    let d1 = entries.iter().find(|e| e.operator_id == "D-1").unwrap();
    assert_eq!((d1.lat, d1.lng), (Some(24.5), Some(73.7)));
    let d2 = entries.iter().find(|e| e.operator_id == "D-2").unwrap();
    assert_eq!((d2.lat, d2.lng), (None, None));
}

#[tokio::test]
async fn subscribers_see_reports_in_ingest_order() {
    let (relay, _store) = relay();
    let _driver = relay.connect("driver");
    let mut first = relay.connect("first");
    let mut second = relay.connect("second");
    relay.handle("first", subscribe("7"));
    relay.handle("second", subscribe("7"));
    relay.handle("driver", start_duty("D-1", "7", "V-1"));
    drain(&mut first);
    drain(&mut second);

    for ts in 1..=50 {
        relay.handle("driver", location("D-1", "7", ts as f64, 0.0, ts));
    }

    let stamps = |events: Vec<ServerEvent>| -> Vec<u64> {
        events
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::PositionChanged(p) => Some(p.timestamp),
                _ => None,
            })
            .collect()
    };
    let expected: Vec<u64> = (1..=50).collect();
    assert_eq!(stamps(drain(&mut first)), expected);
    assert_eq!(stamps(drain(&mut second)), expected);
}

#[tokio::test]
async fn store_outage_does_not_affect_delivery() {
    let (relay, store) = relay();
    store.set_failing(true);
    let _driver = relay.connect("driver");
    let mut passenger = relay.connect("passenger");
    relay.handle("passenger", subscribe("7"));
    relay.handle("driver", start_duty("D-1", "7", "V-1"));
    relay.handle("driver", location("D-1", "7", 1.0, 2.0, 3));

    let names: Vec<_> = drain(&mut passenger).iter().map(ServerEvent::name).collect();
    assert_eq!(names, ["route-snapshot", "operator-online", "position-changed"]);

    relay.writer().flush().await;
    assert_eq!(relay.writer().stats().failed, 3);
    assert_eq!(relay.active_sessions(), 1);
}

#[tokio::test]
async fn disconnect_leaves_nothing_behind() {
    let (relay, _store) = relay();
    let _driver = relay.connect("driver");
    relay.handle("driver", start_duty("D-1", "7", "V-1"));
    relay.handle("driver", subscribe("12"));

    relay.disconnect("driver");

    assert!(relay.registry().get("driver").is_none());
    assert!(relay.router().connection_routes("driver").is_empty());
    assert_eq!(relay.router().subscriber_count("7"), 0);
    assert_eq!(relay.router().subscriber_count("12"), 0);
    assert_eq!(relay.router().stats().connection_count, 0);
}

#[tokio::test]
async fn concurrent_operators_each_end_offline() {
    let (relay, store) = relay();
    let relay = Arc::new(relay);

    let mut tasks = Vec::new();
    for i in 0..16 {
        let relay = Arc::clone(&relay);
        tasks.push(tokio::spawn(async move {
            let conn = format!("driver-{i}");
            let _inbox = relay.connect(&conn);
            relay.handle(&conn, start_duty(&format!("D-{i}"), "7", &format!("V-{i}")));
            relay.handle(&conn, location(&format!("D-{i}"), "7", 1.0, 2.0, i));
            relay.disconnect(&conn);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(relay.active_sessions(), 0);
    relay.writer().flush().await;
    for i in 0..16 {
        assert_eq!(
            store.operator(&format!("D-{i}")).unwrap().status,
            OperatorStatus::Offline
        );
    }
}

#[test]
fn vehicle_handoff_keeps_durable_writes_in_transition_order() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    for round in 0..200 {
        let (relay, store) = rt.block_on(async { relay() });
        let _a = relay.connect("shift-a");
        let _b = relay.connect("shift-b");
        relay.handle("shift-a", start_duty("D-A", "7", "V-1"));

        std::thread::scope(|scope| {
            scope.spawn(|| relay.disconnect("shift-a"));
            scope.spawn(|| {
                while relay.registry().get("shift-a").is_some() {
                    std::hint::spin_loop();
                }
                relay.handle("shift-b", start_duty("D-B", "7", "V-1"));
            });
        });

        rt.block_on(relay.writer().flush());
        assert_eq!(relay.active_sessions(), 1, "round {round}");
        assert!(store.vehicle("V-1").unwrap().is_live, "round {round}");
        assert_eq!(store.operator("D-A").unwrap().status, OperatorStatus::Offline);
        assert_eq!(store.operator("D-B").unwrap().status, OperatorStatus::OnDuty);
    }
}
