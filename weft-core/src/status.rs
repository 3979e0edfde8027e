//! Connection status queues
//!
//! Every endpoint exposes two queues: outgoing (peerings it initiated) and
//! incoming (peerings accepted from others). Handshake and teardown
//! transitions land here with the peer's info and a reason.

use tokio::sync::mpsc;
use weft_model::EndpointInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Initializing,
    Established,
    Disconnected,
    Incompatible,
    Invalid,
}

#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub peer: EndpointInfo,
    pub kind: StatusKind,
    pub reason: String,
}

pub type StatusReceiver = mpsc::UnboundedReceiver<StatusEvent>;

pub(crate) type StatusSender = mpsc::UnboundedSender<StatusEvent>;

pub(crate) fn emit(
    tx: &StatusSender,
    peer: EndpointInfo,
    kind: StatusKind,
    reason: impl Into<String>,
) {
    let _ = tx.send(StatusEvent {
        peer,
        kind,
        reason: reason.into(),
    });
}
