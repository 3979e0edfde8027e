//! Endpoint - the façade applications talk to
//!
//! Wraps one core actor. Peering, publishing, subscriptions, and store
//! attachment all delegate to the core; the two status queues surface
//! connection lifecycle events.

use crate::core_actor::{spawn_core, CoreCmd, CoreHandle, PeerEntry};
use crate::frontend::{MasterRef, StoreFrontend};
use crate::status::StatusReceiver;
use crate::CoreConfig;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use weft_model::{
    Data, EndpointId, FabricError, Filter, NetworkInfo, Payload, Topic,
};
use weft_net::Listener;
use weft_store::{BackendOptions, BackendType};

/// One endpoint of the fabric.
pub struct Endpoint {
    handle: CoreHandle,
    cfg: CoreConfig,
    outgoing: Option<StatusReceiver>,
    incoming: Option<StatusReceiver>,
}

impl Endpoint {
    pub fn new() -> Self {
        Self::with_config(CoreConfig::default())
    }

    pub fn with_config(cfg: CoreConfig) -> Self {
        let (handle, outgoing, incoming) = spawn_core(cfg.clone());
        Endpoint {
            handle,
            cfg,
            outgoing: Some(outgoing),
            incoming: Some(incoming),
        }
    }

    pub fn id(&self) -> EndpointId {
        self.handle.id()
    }

    pub fn handle(&self) -> &CoreHandle {
        &self.handle
    }

    /// Add a local subscriber for the given topics; its filter joins the
    /// endpoint filter and propagates to peers.
    pub async fn subscribe(&self, filter: Filter) -> Result<Subscriber, FabricError> {
        let (tx, rx) = mpsc::channel(self.cfg.subscriber_capacity);
        self.handle.subscribe_lane(filter, tx).await?;
        Ok(Subscriber { rx })
    }

    /// Peer with another in-process endpoint.
    pub async fn peer(&self, other: &Endpoint) -> Result<(), FabricError> {
        self.handle.peer_with(other.handle.clone()).await
    }

    /// Peer with a remote endpoint; a supervisor retries every `retry`
    /// (zero retries once and gives up).
    pub async fn peer_remotely(
        &self,
        host: impl Into<String>,
        port: u16,
        retry: Duration,
    ) -> Result<(), FabricError> {
        let network = NetworkInfo {
            host: host.into(),
            port,
        };
        self.handle.peer_remotely(network, retry).await
    }

    pub async fn unpeer(&self, peer: EndpointId) -> Result<(), FabricError> {
        self.handle.unpeer(peer).await
    }

    /// Accept inbound peerings on `addr`; returns the bound address.
    pub async fn listen(&self, addr: &str) -> Result<SocketAddr, FabricError> {
        let listener = Listener::bind(addr)
            .await
            .map_err(|e| FabricError::InvalidArgument(format!("bind {addr}: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| FabricError::InvalidArgument(e.to_string()))?;

        let (accepted_tx, mut accepted_rx) = mpsc::channel(16);
        listener.spawn_accept(self.handle.conn_ingest(), accepted_tx);

        let handle = self.handle.clone();
        tokio::spawn(async move {
            while let Some(conn) = accepted_rx.recv().await {
                let opened = CoreCmd::ConnOpened {
                    conn,
                    network: None,
                    stop: None,
                };
                if handle.tx.send(opened).await.is_err() {
                    break;
                }
            }
        });
        Ok(local)
    }

    pub async fn publish(&self, topic: impl Into<Topic>, data: Data) -> Result<(), FabricError> {
        self.handle.publish(topic.into(), data).await
    }

    pub async fn attach_master(
        &self,
        name: impl Into<String>,
        backend: BackendType,
        options: BackendOptions,
    ) -> Result<StoreFrontend, FabricError> {
        self.handle.attach_master(name, backend, options).await
    }

    pub async fn attach_clone(
        &self,
        name: impl Into<String>,
    ) -> Result<StoreFrontend, FabricError> {
        self.handle.attach_clone(name).await
    }

    pub async fn lookup_master(
        &self,
        name: impl Into<String>,
    ) -> Result<MasterRef, FabricError> {
        self.handle.lookup_master(name).await
    }

    pub async fn peers(&self) -> Result<Vec<PeerEntry>, FabricError> {
        self.handle.peers().await
    }

    /// Take the outgoing connection status queue. Yields `None` after the
    /// first call.
    pub fn outgoing_status(&mut self) -> Option<StatusReceiver> {
        self.outgoing.take()
    }

    /// Take the incoming connection status queue. Yields `None` after the
    /// first call.
    pub fn incoming_status(&mut self) -> Option<StatusReceiver> {
        self.incoming.take()
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new()
    }
}

/// A local subscription's receiving end. Store-internal frames riding the
/// same lanes are filtered out.
pub struct Subscriber {
    rx: mpsc::Receiver<(Topic, Payload)>,
}

impl Subscriber {
    pub async fn recv(&mut self) -> Option<(Topic, Data)> {
        while let Some((topic, payload)) = self.rx.recv().await {
            if let Payload::User(data) = payload {
                return Some((topic, data));
            }
        }
        None
    }

    /// Non-blocking variant; `None` when nothing user-visible is queued.
    pub fn try_recv(&mut self) -> Option<(Topic, Data)> {
        while let Ok((topic, payload)) = self.rx.try_recv() {
            if let Payload::User(data) = payload {
                return Some((topic, data));
            }
        }
        None
    }
}
