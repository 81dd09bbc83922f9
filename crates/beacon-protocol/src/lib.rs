//! # beacon-protocol
//!
//! Wire protocol definitions for the Beacon transit relay.
//!
//! ## Events
//!
//! - `start-duty` / `end-duty` - Operator duty lifecycle
//! - `location-update` - Operator position reports
//! - `subscribe-route` / `unsubscribe-route` - Passenger route membership
//! - `operator-online` / `position-changed` / `operator-offline` /
//!   `route-snapshot` - What route subscribers receive
//!
//! ## Example
//!
//! ```rust
//! use beacon_protocol::{codec, ClientEvent};
//!
//! let event = ClientEvent::SubscribeRoute { route_id: "7".to_string() };
//!
//! let text = codec::encode_json(&event).unwrap();
//! let decoded: ClientEvent = codec::decode_json(&text).unwrap();
//! assert_eq!(event, decoded);
//! ```

pub mod codec;
pub mod events;
pub mod version;

pub use codec::{decode, encode, Encoding, ProtocolError};
pub use events::{ClientEvent, LocationUpdate, PositionChanged, ServerEvent, SnapshotEntry};
pub use version::{Version, PROTOCOL_VERSION};
