//! Error kinds shared across the fabric

use thiserror::Error;

/// Errors surfaced by endpoint operations and store actors.
///
/// Protocol violations on the wire are never errors here: they are logged
/// and dropped by the core without disturbing its state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FabricError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("a master for this store is already reachable")]
    MasterExists,

    #[error("no master found for this store")]
    NoSuchMaster,

    #[error("no downstream stage to deliver the reply to")]
    NoDownstreamStages,

    #[error("cannot add anonymous downstream")]
    CannotAddDownstream,

    #[error("store mutation targeted a value of the wrong shape")]
    TypeClash,

    #[error("backend failure: {0}")]
    BackendFailure(String),

    #[error("peer speaks an incompatible protocol version")]
    PeerIncompatible,

    #[error("operation timed out")]
    Timeout,

    #[error("actor channel closed")]
    ChannelClosed,
}
