//! End-to-end load generator for Beacon.
//!
//! Drives real WebSocket connections against a running server: a number of
//! operators stream positions on a route while passengers watch it, and the
//! passenger-side receive rate is reported.
//!
//! Usage: `beacon_load [operators] [passengers] [url]`

use beacon_protocol::{codec, ClientEvent, LocationUpdate, ServerEvent};
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const DEFAULT_URL: &str = "ws://127.0.0.1:8080/ws?encoding=msgpack";
const ROUTE: &str = "load-test";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;
const REPORT_INTERVAL: Duration = Duration::from_millis(100);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let operators = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(50);
    let passengers = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(500);
    let url = args.get(3).cloned().unwrap_or_else(|| DEFAULT_URL.to_string());

    println!("Beacon load test against {url}");
    println!("  operators:  {operators} (one report every {REPORT_INTERVAL:?})");
    println!("  passengers: {passengers} watching route {ROUTE}");
    println!();

    let received = Arc::new(AtomicU64::new(0));
    let sent = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(operators + passengers + 1));
    let mut handles = Vec::new();

    for id in 0..passengers {
        let url = url.clone();
        let received = Arc::clone(&received);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_passenger(&url, received, barrier).await {
                eprintln!("Passenger {id} error: {e}");
            }
        }));
    }

    for id in 0..operators {
        let url = url.clone();
        let sent = Arc::clone(&sent);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_operator(id, &url, sent, barrier).await {
                eprintln!("Operator {id} error: {e}");
            }
        }));
    }

    barrier.wait().await;
    println!("All {} clients connected", operators + passengers);

    println!("Warming up for {WARMUP_SECS}s...");
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    received.store(0, Ordering::SeqCst);
    sent.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("Measuring for {BENCH_SECS}s...");
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed().as_secs_f64();
    let sent = sent.load(Ordering::SeqCst);
    let received = received.load(Ordering::SeqCst);
    let expected = sent * passengers as u64;

    println!();
    println!("Results");
    println!("  reports sent:        {sent:>12} ({:.0}/s)", sent as f64 / elapsed);
    println!("  positions received:  {received:>12} ({:.0}/s)", received as f64 / elapsed);
    if expected > 0 {
        println!(
            "  delivery ratio:      {:>11.1}%",
            received as f64 / expected as f64 * 100.0
        );
    }

    for handle in handles {
        handle.abort();
    }
}

async fn run_passenger(
    url: &str,
    received: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let (ws, _) = connect_async(url).await?;
    let (mut sender, mut receiver) = ws.split();

    // connected
    receiver.next().await;

    let subscribe = codec::encode(&ClientEvent::SubscribeRoute {
        route_id: ROUTE.to_string(),
    })?;
    sender.send(Message::Binary(subscribe.to_vec())).await?;

    barrier.wait().await;

    let mut buf = BytesMut::with_capacity(65536);
    while let Some(result) = receiver.next().await {
        if let Ok(Message::Binary(data)) = result {
            buf.extend_from_slice(&data);
            while let Ok(Some(event)) = codec::decode_from::<ServerEvent>(&mut buf) {
                if matches!(event, ServerEvent::PositionChanged(_)) {
                    received.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
    Ok(())
}

async fn run_operator(
    id: usize,
    url: &str,
    sent: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let (ws, _) = connect_async(url).await?;
    let (mut sender, mut receiver) = ws.split();
    receiver.next().await;

    // The operator is a route member too; keep its socket drained.
    tokio::spawn(async move { while receiver.next().await.is_some() {} });

    let operator_id = format!("load-op-{id}");
    let start = codec::encode(&ClientEvent::StartDuty {
        operator_id: operator_id.clone(),
        route_id: ROUTE.to_string(),
        vehicle_id: format!("load-vehicle-{id}"),
    })?;
    sender.send(Message::Binary(start.to_vec())).await?;

    barrier.wait().await;

    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    let mut step = 0u64;
    loop {
        ticker.tick().await;
        step += 1;
        let report = codec::encode(&ClientEvent::LocationUpdate(LocationUpdate {
            operator_id: operator_id.clone(),
            route_id: ROUTE.to_string(),
            vehicle_id: None,
            lat: 24.58 + step as f64 * 1e-5,
            lng: 73.70 + id as f64 * 1e-4,
            heading: Some(90.0),
            is_full: Some(false),
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)?
                .as_millis() as u64,
        }))?;
        if sender.send(Message::Binary(report.to_vec())).await.is_err() {
            break;
        }
        sent.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}
