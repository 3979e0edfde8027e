//! Wire protocol - peer frames and the store command envelope
//!
//! Frames travel length-prefixed over connections (or directly between
//! in-process cores). `PeerInit` carries the wire version so incompatible
//! peers are rejected at the first handshake step.

use crate::data::{Data, Span, Timestamp};
use crate::entry::{ExpirationTime, SequenceNum, Snapshot};
use crate::ident::{EndpointId, EndpointInfo, StreamId};
use crate::topic::{Filter, Topic};
use serde::{Deserialize, Serialize};

/// Version tag checked at handshake step #1.
pub const WIRE_VERSION: u32 = 1;

/// A frame exchanged between peered cores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Step #0/#1: the initiator announces itself and its filter.
    PeerInit {
        version: u32,
        filter: Filter,
        origin: EndpointInfo,
    },
    /// Step #2: the responder opens its return stream.
    PeerOpen {
        stream: StreamId,
        filter: Filter,
        origin: EndpointInfo,
    },
    /// Step #3: the initiator opens its forward stream.
    PeerAck { stream: StreamId },
    /// The sender's filter changed; replaces the stored copy.
    FilterUpdate { filter: Filter },
    /// A routed message.
    Publish { topic: Topic, payload: Payload },
    /// Flow-control grant for one outbound stream.
    Credit { stream: StreamId, amount: u32 },
    /// Resolver probe: does the sender host a master for `name`?
    MasterQuery { name: String, request: u64 },
    MasterReply { request: u64, found: bool },
    /// Orderly teardown of the peering.
    Unpeer,
}

/// What a publish carries: user data, or a store command on a reserved
/// topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    User(Data),
    Command(StoreCommand),
}

/// Commands riding publishes on the reserved store topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreCommand {
    Put {
        key: Data,
        value: Data,
        expiry: Option<Span>,
    },
    Erase {
        key: Data,
    },
    Clear,
    Increment {
        key: Data,
        by: i64,
        mod_time: Timestamp,
    },
    AddToSet {
        key: Data,
        element: Data,
        mod_time: Timestamp,
    },
    RemoveFromSet {
        key: Data,
        element: Data,
        mod_time: Timestamp,
    },
    PushLeft {
        key: Data,
        items: Vec<Data>,
        mod_time: Timestamp,
    },
    PushRight {
        key: Data,
        items: Vec<Data>,
        mod_time: Timestamp,
    },
    PopLeft {
        key: Data,
        mod_time: Timestamp,
    },
    PopRight {
        key: Data,
        mod_time: Timestamp,
    },
    /// Scheduled expiry; applied only if the stored expiry still equals
    /// `expiry`.
    Expire {
        key: Data,
        expiry: ExpirationTime,
    },
    /// A clone asks the master for a full snapshot.
    Snapshot {
        requester: EndpointId,
    },
    /// The master ships a snapshot to one requester.
    SnapshotReply {
        target: EndpointId,
        snapshot: Snapshot,
    },
    /// Master-to-clone replication step.
    Update {
        seq: SequenceNum,
        op: UpdateOp,
    },
}

/// The materialized state change a clone applies for one sequence step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdateOp {
    Put {
        key: Data,
        value: Data,
        expiry: Option<ExpirationTime>,
    },
    Erase {
        key: Data,
    },
    Clear,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip_through_bincode() {
        let frame = PeerMessage::Publish {
            topic: Topic::new("x/y"),
            payload: Payload::User(Data::Integer(42)),
        };
        let bytes = bincode::serialize(&frame).unwrap();
        let back: PeerMessage = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn init_frame_carries_version() {
        let frame = PeerMessage::PeerInit {
            version: WIRE_VERSION,
            filter: Filter::new(),
            origin: EndpointInfo::new(EndpointId::new_v4()),
        };
        let bytes = bincode::serialize(&frame).unwrap();
        match bincode::deserialize(&bytes).unwrap() {
            PeerMessage::PeerInit { version, .. } => assert_eq!(version, WIRE_VERSION),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
