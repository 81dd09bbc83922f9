//! # beacon-core
//!
//! Session tracking, route topics and the operator duty state machine for
//! the Beacon transit relay.
//!
//! - **Registry** - Which connections are broadcasting, indexed by route
//! - **Router** - Route topics and per-connection outboxes
//! - **Duty** - Start/end duty transitions and their side effects
//! - **Ingest** - Position reports fanned out to route subscribers
//! - **Writer** - Durable status writes, off the real-time path
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│    Relay    │────▶│   Router    │────▶ outboxes
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                        │       │
//!                        ▼       ▼
//!               ┌──────────┐  ┌─────────────┐     ┌─────────────┐
//!               │ Registry │  │ StoreWriter │────▶│ StatusStore │
//!               └──────────┘  └─────────────┘     └─────────────┘
//! ```

pub mod duty;
pub mod ingest;
pub mod registry;
pub mod relay;
pub mod router;
pub mod routes;
pub mod session;
pub mod store;
pub mod topic;
pub mod writer;

pub use duty::{DutyCommand, EndCause, Transition};
pub use ingest::{IngestOutcome, PositionReport};
pub use registry::SessionRegistry;
pub use relay::{Handled, Relay, RelayConfig};
pub use router::{RouterConfig, RouterError, RouterStats, TopicRouter};
pub use routes::{LatLng, MemoryRouteDirectory, RouteDirectory, RouteGeometry, Stop};
pub use session::{ConnectionId, RouteId, Session};
pub use store::{MemoryStore, OperatorStatus, StatusStore, StoreError, VehicleUpdate};
pub use topic::{Inbox, Outbox};
pub use writer::{StatusWrite, StoreWriter, WriterStats};
