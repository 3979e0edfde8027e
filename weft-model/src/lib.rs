//! Weft Model
//!
//! Shared types for the weft publish/subscribe fabric:
//! - **Data**: structural value universe carried by publishes and stores
//! - **Topic / Filter**: hierarchical names and sorted-unique interest sets
//! - **EndpointInfo**: endpoint identity and optional network location
//! - **Entry / Snapshot**: store value entries, expiries, and snapshots
//! - **PeerMessage / StoreCommand**: the wire protocol and store envelope
//! - **FabricError**: error kinds shared across the fabric

pub mod data;
pub mod entry;
pub mod error;
pub mod ident;
pub mod topic;
pub mod wire;

pub use data::{Data, Port, Protocol, Real, Span, Subnet, Timestamp};
pub use entry::{Entry, ExpirationTime, SequenceNum, Snapshot};
pub use error::FabricError;
pub use ident::{EndpointId, EndpointInfo, NetworkInfo, StreamId};
pub use topic::{store_clone_topic, store_master_topic, Filter, Topic};
pub use uuid::Uuid;
pub use wire::{Payload, PeerMessage, StoreCommand, UpdateOp, WIRE_VERSION};
