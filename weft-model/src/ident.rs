//! Endpoint identity and stream identifiers

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable, opaque endpoint identity. The nil id marks an anonymous sender
/// and is rejected by handshake and subscription handlers.
pub type EndpointId = Uuid;

/// Network location of an endpoint, when known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for NetworkInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Identity plus optional network location, as exchanged during handshakes
/// and surfaced on status queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub id: EndpointId,
    pub network: Option<NetworkInfo>,
}

impl EndpointInfo {
    pub fn new(id: EndpointId) -> Self {
        EndpointInfo { id, network: None }
    }

    pub fn with_network(id: EndpointId, network: NetworkInfo) -> Self {
        EndpointInfo {
            id,
            network: Some(network),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.id.is_nil()
    }
}

/// Identifier of one unidirectional peering stream, allocated by the
/// endpoint that receives on it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StreamId(pub u64);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
