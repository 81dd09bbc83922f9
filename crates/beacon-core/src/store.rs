//! Durable operator and vehicle status.
//!
//! The relay only ever writes to the store, and only through upserts keyed
//! by operator or vehicle id. Writes are issued by [`crate::writer::StoreWriter`]
//! off the real-time path.

use crate::routes::LatLng;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the write.
    #[error("Write rejected: {0}")]
    Rejected(String),
}

/// Duty status of an operator as recorded durably.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OperatorStatus {
    #[default]
    Offline,
    Assigned,
    OnDuty,
}

/// Partial update of a vehicle record. `None` fields are left untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleUpdate {
    pub is_live: bool,
    pub position: Option<LatLng>,
    pub heading: Option<f64>,
    pub is_full: Option<bool>,
    /// Relay time of the update.
    pub at: u64,
}

impl VehicleUpdate {
    /// Vehicle went live or stopped being live.
    #[must_use]
    pub fn liveness(is_live: bool, at: u64) -> Self {
        Self {
            is_live,
            position: None,
            heading: None,
            is_full: None,
            at,
        }
    }

    /// Vehicle reported a new position.
    #[must_use]
    pub fn position(position: LatLng, heading: f64, is_full: bool, at: u64) -> Self {
        Self {
            is_live: true,
            position: Some(position),
            heading: Some(heading),
            is_full: Some(is_full),
            at,
        }
    }
}

/// Upsert-only view of the durable store.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Record an operator's duty status, creating the record if needed.
    async fn set_operator_status(
        &self,
        operator_id: &str,
        status: OperatorStatus,
        at: u64,
    ) -> Result<(), StoreError>;

    /// Apply an update to a vehicle record, creating the record if needed.
    async fn update_vehicle(&self, vehicle_id: &str, update: &VehicleUpdate)
        -> Result<(), StoreError>;
}

/// Durable operator record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorRecord {
    pub status: OperatorStatus,
    pub updated_at: u64,
}

/// Durable vehicle record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleRecord {
    pub is_live: bool,
    pub position: Option<LatLng>,
    pub heading: f64,
    pub is_full: bool,
    pub last_update: u64,
}

impl Default for VehicleRecord {
    fn default() -> Self {
        Self {
            is_live: false,
            position: None,
            heading: 0.0,
            is_full: false,
            last_update: 0,
        }
    }
}

/// Store kept in process memory.
///
/// Used when no external store is configured and in tests, where
/// [`MemoryStore::set_failing`] simulates an outage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    operators: DashMap<String, OperatorRecord>,
    vehicles: DashMap<String, VehicleRecord>,
    failing: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    #[must_use]
    pub fn operator(&self, operator_id: &str) -> Option<OperatorRecord> {
        self.operators.get(operator_id).map(|r| r.clone())
    }

    #[must_use]
    pub fn vehicle(&self, vehicle_id: &str) -> Option<VehicleRecord> {
        self.vehicles.get(vehicle_id).map(|r| r.clone())
    }

    /// Number of writes applied successfully.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store set to fail".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn set_operator_status(
        &self,
        operator_id: &str,
        status: OperatorStatus,
        at: u64,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        self.operators.insert(
            operator_id.to_string(),
            OperatorRecord {
                status,
                updated_at: at,
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_vehicle(
        &self,
        vehicle_id: &str,
        update: &VehicleUpdate,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut record = self.vehicles.entry(vehicle_id.to_string()).or_default();
        record.is_live = update.is_live;
        if let Some(position) = update.position {
            record.position = Some(position);
        }
        if let Some(heading) = update.heading {
            record.heading = heading;
        }
        if let Some(is_full) = update.is_full {
            record.is_full = is_full;
        }
        record.last_update = update.at;
        drop(record);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
