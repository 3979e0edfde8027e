//! Connection tasks - bridging sockets to core mailboxes
//!
//! Each established socket gets a reader task (frames flow into the core's
//! ingest channel as `ConnEvent`s) and a writer task (frames queued on the
//! `ConnHandle` flow out to the socket). Dropping every clone of the handle
//! shuts the writer down; the reader reports closure through the ingest
//! channel and an extra oneshot for whoever supervises the connection.

use crate::framing::{MessageSink, MessageStream};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use weft_model::PeerMessage;

/// Process-unique connection identifier.
pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

const WRITER_QUEUE: usize = 64;

/// What a connection delivers into the owning core.
#[derive(Debug)]
pub enum ConnEvent {
    Message(ConnId, PeerMessage),
    Closed(ConnId),
}

/// Sending side of one connection.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    pub id: ConnId,
    tx: mpsc::Sender<PeerMessage>,
}

impl ConnHandle {
    /// Queue a frame for the writer task. Fails once the connection is
    /// gone.
    pub async fn send(&self, msg: PeerMessage) -> Result<(), ()> {
        self.tx.send(msg).await.map_err(|_| ())
    }
}

/// Spawn reader/writer tasks for an established socket.
///
/// Returns the handle plus a oneshot that fires when the reader stops,
/// for reconnect supervisors that outlive the core's own bookkeeping.
pub fn spawn_connection(
    stream: TcpStream,
    ingest: mpsc::Sender<ConnEvent>,
) -> (ConnHandle, oneshot::Receiver<()>) {
    let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let (read_half, write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<PeerMessage>(WRITER_QUEUE);
    let (closed_tx, closed_rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut sink = MessageSink::new(write_half);
        while let Some(msg) = rx.recv().await {
            if let Err(e) = sink.send(&msg).await {
                tracing::debug!(conn = id, error = %e, "connection writer stopped");
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut stream = MessageStream::new(read_half);
        loop {
            match stream.recv().await {
                Ok(Some(msg)) => {
                    if ingest.send(ConnEvent::Message(id, msg)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(conn = id, error = %e, "connection reader stopped");
                    break;
                }
            }
        }
        let _ = ingest.send(ConnEvent::Closed(id)).await;
        let _ = closed_tx.send(());
    });

    (ConnHandle { id, tx }, closed_rx)
}

/// Connect to a remote endpoint and spawn its connection tasks.
pub async fn connect(
    host: &str,
    port: u16,
    ingest: mpsc::Sender<ConnEvent>,
) -> std::io::Result<(ConnHandle, oneshot::Receiver<()>)> {
    let stream = TcpStream::connect((host, port)).await?;
    Ok(spawn_connection(stream, ingest))
}

/// Accepts inbound peerings and spawns connection tasks for each.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub async fn bind(addr: impl ToSocketAddrs) -> std::io::Result<Self> {
        Ok(Listener {
            inner: TcpListener::bind(addr).await?,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.inner.local_addr()
    }

    /// Run the accept loop, announcing each new connection through
    /// `accepted` and wiring its frames into `ingest`.
    pub fn spawn_accept(
        self,
        ingest: mpsc::Sender<ConnEvent>,
        accepted: mpsc::Sender<ConnHandle>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.inner.accept().await {
                    Ok((stream, addr)) => {
                        tracing::debug!(peer = %addr, "accepted connection");
                        let (handle, _closed) = spawn_connection(stream, ingest.clone());
                        if accepted.send(handle).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_model::{Data, Payload, Topic};

    #[tokio::test]
    async fn frames_flow_between_connected_sockets() {
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (server_ingest, mut server_rx) = mpsc::channel(16);
        let (accepted_tx, mut accepted_rx) = mpsc::channel(4);
        listener.spawn_accept(server_ingest, accepted_tx);

        let (client_ingest, mut client_rx) = mpsc::channel(16);
        let (client, _closed) = connect("127.0.0.1", addr.port(), client_ingest)
            .await
            .unwrap();

        let msg = PeerMessage::Publish {
            topic: Topic::new("t"),
            payload: Payload::User(Data::from(1i64)),
        };
        client.send(msg.clone()).await.unwrap();

        let event = server_rx.recv().await.unwrap();
        let server_conn = accepted_rx.recv().await.unwrap();
        match event {
            ConnEvent::Message(_, received) => assert_eq!(received, msg),
            other => panic!("unexpected event: {other:?}"),
        }

        // And back the other way.
        server_conn.send(PeerMessage::Unpeer).await.unwrap();
        match client_rx.recv().await.unwrap() {
            ConnEvent::Message(_, PeerMessage::Unpeer) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reader_reports_closure() {
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (server_ingest, _server_rx) = mpsc::channel(16);
        let (accepted_tx, mut accepted_rx) = mpsc::channel(4);
        listener.spawn_accept(server_ingest, accepted_tx);

        let (client_ingest, mut client_rx) = mpsc::channel(16);
        let (_client, closed) = connect("127.0.0.1", addr.port(), client_ingest)
            .await
            .unwrap();

        // Dropping the server side closes the socket.
        let server_conn = accepted_rx.recv().await.unwrap();
        drop(server_conn);

        match client_rx.recv().await.unwrap() {
            ConnEvent::Closed(_) => {}
            other => panic!("unexpected event: {other:?}"),
        }
        closed.await.unwrap();
    }
}
