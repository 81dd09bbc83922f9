//! Relay benchmarks for Beacon.
//!
//! Measures position ingest with fan-out to route subscribers, and the duty
//! transitions around it.

use beacon_core::{
    DutyCommand, Inbox, MemoryStore, PositionReport, Relay, RelayConfig, StoreWriter, TopicRouter,
};
use beacon_protocol::ServerEvent;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

fn relay(rt: &Runtime) -> Relay {
    let _guard = rt.enter();
    let writer = StoreWriter::spawn(Arc::new(MemoryStore::new()), 1 << 16);
    Relay::new(RelayConfig::default(), writer)
}

fn report(timestamp: u64) -> PositionReport {
    PositionReport {
        operator_id: "D-1".to_string(),
        route_id: "7".to_string(),
        vehicle_id: None,
        position: beacon_core::LatLng::new(24.58, 73.70),
        heading: 90.0,
        is_full: false,
        timestamp,
    }
}

fn drain(inboxes: &mut [Inbox]) {
    for inbox in inboxes {
        while inbox.try_recv().is_ok() {}
    }
}

/// Benchmark one report fanned out to N subscribers.
fn bench_ingest_fanout(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("ingest_fanout");

    for size in [1, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let relay = relay(&rt);
            let mut inboxes: Vec<Inbox> = (0..size)
                .map(|i| {
                    let conn = format!("passenger-{}", i);
                    let inbox = relay.connect(&conn);
                    relay.subscribe_route(&conn, "7").unwrap();
                    inbox
                })
                .collect();
            let _driver = relay.connect("driver");
            relay.apply(
                "driver",
                DutyCommand::StartDuty {
                    operator_id: "D-1".to_string(),
                    route_id: "7".to_string(),
                    vehicle_id: "V-1".to_string(),
                },
            );
            drain(&mut inboxes);

            let mut ts = 0u64;
            b.iter(|| {
                ts += 1;
                relay.ingest(black_box("driver"), report(ts));
                drain(&mut inboxes);
            });
        });
    }

    group.finish();
}

/// Benchmark start-duty followed by end-duty on a watched route.
fn bench_duty_cycle(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("duty_cycle");

    group.bench_function("start_end", |b| {
        let relay = relay(&rt);
        let mut watchers: Vec<Inbox> = (0..10)
            .map(|i| {
                let conn = format!("passenger-{}", i);
                let inbox = relay.connect(&conn);
                relay.subscribe_route(&conn, "7").unwrap();
                inbox
            })
            .collect();
        let _driver = relay.connect("driver");

        b.iter(|| {
            relay.apply(
                "driver",
                DutyCommand::StartDuty {
                    operator_id: "D-1".to_string(),
                    route_id: "7".to_string(),
                    vehicle_id: "V-1".to_string(),
                },
            );
            relay.apply(
                "driver",
                DutyCommand::EndDuty {
                    operator_id: "D-1".to_string(),
                    route_id: "7".to_string(),
                },
            );
            drain(&mut watchers);
        });
    });

    group.finish();
}

/// Benchmark raw topic publish without the relay around it.
fn bench_router_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("router_publish");

    group.bench_function("100_sub", |b| {
        let router = TopicRouter::new();
        let mut inboxes: Vec<Inbox> = (0..100)
            .map(|i| {
                let conn = format!("conn-{}", i);
                let (tx, rx) = mpsc::channel(1024);
                router.attach(conn.as_str(), tx);
                router.subscribe(&conn, "7").unwrap();
                rx
            })
            .collect();

        b.iter(|| {
            router.publish("7", black_box(ServerEvent::operator_offline("D-1", "7")));
            drain(&mut inboxes);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_ingest_fanout,
    bench_duty_cycle,
    bench_router_publish,
);
criterion_main!(benches);
