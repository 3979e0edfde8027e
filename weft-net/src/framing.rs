//! Message framing using tokio-util LengthDelimitedCodec
//!
//! Provides a clean interface for sending/receiving length-prefixed
//! PeerMessage over any AsyncWrite/AsyncRead stream, decoupled from the
//! concrete transport.

use crate::error::NetError;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use weft_model::PeerMessage;

/// Framed writer for sending PeerMessage over any AsyncWrite stream
pub struct MessageSink<W: AsyncWrite + Send + Unpin> {
    inner: FramedWrite<W, LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Send + Unpin> MessageSink<W> {
    pub fn new(stream: W) -> Self {
        Self {
            inner: FramedWrite::new(stream, LengthDelimitedCodec::new()),
        }
    }

    /// Send a PeerMessage (length-prefixed)
    pub async fn send(&mut self, msg: &PeerMessage) -> Result<(), NetError> {
        let bytes = bincode::serialize(msg)?;
        self.inner
            .send(bytes.into())
            .await
            .map_err(NetError::Io)
    }
}

/// Framed reader for receiving PeerMessage from any AsyncRead stream
pub struct MessageStream<R: AsyncRead + Send + Unpin> {
    inner: FramedRead<R, LengthDelimitedCodec>,
}

impl<R: AsyncRead + Send + Unpin> MessageStream<R> {
    pub fn new(stream: R) -> Self {
        Self {
            inner: FramedRead::new(stream, LengthDelimitedCodec::new()),
        }
    }

    /// Receive the next PeerMessage (or None if the stream closed)
    pub async fn recv(&mut self) -> Result<Option<PeerMessage>, NetError> {
        match self.inner.next().await {
            Some(Ok(bytes)) => bincode::deserialize(&bytes).map(Some).map_err(NetError::from),
            Some(Err(e)) => Err(NetError::Io(e)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_model::{Data, Payload, Topic};

    #[tokio::test]
    async fn frames_round_trip_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let mut sink = MessageSink::new(client);
        let mut stream = MessageStream::new(server);

        let msg = PeerMessage::Publish {
            topic: Topic::new("a/b"),
            payload: Payload::User(Data::from(7i64)),
        };
        sink.send(&msg).await.unwrap();
        let received = stream.recv().await.unwrap().unwrap();
        assert_eq!(received, msg);

        drop(sink);
        assert!(stream.recv().await.unwrap().is_none());
    }
}
