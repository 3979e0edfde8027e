//! Weft Core
//!
//! The per-endpoint coordinator of the weft fabric:
//! - **Core actor**: peer lifecycle and the 3-way handshake, publish
//!   routing, filter propagation, store attachment
//! - **Governor**: per-destination outbound lanes with credit-based flow
//! - **Master / Clone actors**: authoritative and replica store state
//! - **Resolver**: locates remote masters across known peers
//! - **Supervisor**: reconnect loop for remote peerings
//! - **Endpoint**: the façade the enclosing application talks to

pub mod clone_actor;
pub mod core_actor;
pub mod endpoint;
pub mod frontend;
mod governor;
pub mod master;
mod resolver;
pub mod status;
mod supervisor;

pub use clone_actor::CloneHandle;
pub use core_actor::{spawn_core, CoreHandle, PeerEntry, PeerPhase};
pub use endpoint::{Endpoint, Subscriber};
pub use frontend::{MasterRef, StoreFrontend};
pub use master::MasterHandle;
pub use status::{StatusEvent, StatusKind, StatusReceiver};

use std::time::Duration;

/// Tunables for one core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Credit granted to a peer per flow-control window.
    pub credit_window: u32,
    /// Queued messages a credit-starved lane buffers before it blocks.
    pub queue_limit: usize,
    /// Channel capacity of local subscriber and store lanes.
    pub subscriber_capacity: usize,
    /// How long the master resolver waits for peer replies.
    pub resolver_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            credit_window: 64,
            queue_limit: 256,
            subscriber_capacity: 64,
            resolver_timeout: Duration::from_secs(5),
        }
    }
}
