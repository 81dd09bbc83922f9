//! Background writer for durable status updates.
//!
//! Writes are queued on a bounded channel and applied in order by a single
//! worker task. Enqueueing never waits: when the queue is full the write is
//! dropped and counted, so a slow store cannot stall the relay.

use crate::store::{OperatorStatus, StatusStore, VehicleUpdate};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// One durable side effect of a relay event.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusWrite {
    Operator {
        operator_id: String,
        status: OperatorStatus,
        at: u64,
    },
    Vehicle {
        vehicle_id: String,
        update: VehicleUpdate,
    },
}

impl StatusWrite {
    fn kind(&self) -> &'static str {
        match self {
            StatusWrite::Operator { .. } => "operator",
            StatusWrite::Vehicle { .. } => "vehicle",
        }
    }
}

enum Job {
    Write(StatusWrite),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct Counters {
    applied: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Writer statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Writes the store accepted.
    pub applied: u64,
    /// Writes the store rejected.
    pub failed: u64,
    /// Writes discarded because the queue was full or the worker gone.
    pub dropped: u64,
}

/// Handle to the background writer. Cheap to clone.
#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::Sender<Job>,
    counters: Arc<Counters>,
}

impl StoreWriter {
    /// Spawn the worker on the current Tokio runtime.
    #[must_use]
    pub fn spawn(store: Arc<dyn StatusStore>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(Counters::default());
        tokio::spawn(run_worker(store, rx, Arc::clone(&counters)));
        Self { tx, counters }
    }

    /// Queue a write without waiting.
    ///
    /// Returns `false` if the write was dropped.
    pub fn enqueue(&self, write: StatusWrite) -> bool {
        match self.tx.try_send(Job::Write(write)) {
            Ok(()) => true,
            Err(TrySendError::Full(Job::Write(write))) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(kind = write.kind(), "Store queue full, write dropped");
                false
            }
            Err(_) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Store writer stopped, write dropped");
                false
            }
        }
    }

    /// Wait until every write queued before this call has been attempted.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Job::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> WriterStats {
        WriterStats {
            applied: self.counters.applied.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Writes waiting in the queue.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

async fn run_worker(store: Arc<dyn StatusStore>, mut rx: mpsc::Receiver<Job>, counters: Arc<Counters>) {
    debug!("Store writer started");
    while let Some(job) = rx.recv().await {
        match job {
            Job::Write(write) => {
                let result = match &write {
                    StatusWrite::Operator {
                        operator_id,
                        status,
                        at,
                    } => store.set_operator_status(operator_id, *status, *at).await,
                    StatusWrite::Vehicle { vehicle_id, update } => {
                        store.update_vehicle(vehicle_id, update).await
                    }
                };
                match result {
                    Ok(()) => {
                        counters.applied.fetch_add(1, Ordering::Relaxed);
                        trace!(write = ?write, "Store write applied");
                    }
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(write = ?write, error = %e, "Store write failed");
                    }
                }
            }
            Job::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Store writer stopped");
}
