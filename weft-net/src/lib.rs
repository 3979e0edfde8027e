//! Weft Net
//!
//! Transport plumbing between weft cores:
//! - **MessageSink / MessageStream**: length-prefixed `PeerMessage` framing
//!   over any `AsyncWrite`/`AsyncRead`
//! - **Connection tasks**: reader/writer pairs bridging a TCP socket to a
//!   core's mailbox
//! - **Listener**: accept loop for inbound peerings

pub mod conn;
pub mod error;
pub mod framing;

pub use conn::{connect, spawn_connection, ConnEvent, ConnHandle, ConnId, Listener};
pub use error::NetError;
pub use framing::{MessageSink, MessageStream};
