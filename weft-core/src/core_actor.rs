//! Core actor - the per-endpoint coordinator
//!
//! One task per endpoint. Owns the filter, the governor's lanes, the peer
//! handshake state machine, and the store registry. Everything reaches it
//! through its command mailbox or its connection ingest channel; replies
//! travel back over oneshot channels.
//!
//! Protocol violations (anonymous handshakes, duplicate steps, frames from
//! unknown peers) are logged and dropped; they never disturb existing
//! state.

use crate::clone_actor::{self, CloneHandle};
use crate::frontend::{MasterRef, StoreFrontend};
use crate::governor::Governor;
use crate::master::{self, MasterHandle};
use crate::resolver;
use crate::status::{emit, StatusKind, StatusReceiver, StatusSender};
use crate::supervisor;
use crate::CoreConfig;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use weft_net::{ConnEvent, ConnHandle, ConnId};
use weft_model::{
    store_clone_topic, store_master_topic, Data, EndpointId, EndpointInfo, FabricError, Filter,
    NetworkInfo, Payload, PeerMessage, StoreCommand, StreamId, Topic, WIRE_VERSION,
};
use weft_store::{open_backend, BackendOptions, BackendType};

const CORE_MAILBOX: usize = 1024;

type Resp<T> = oneshot::Sender<Result<T, FabricError>>;

/// Commands processed by the core actor.
pub(crate) enum CoreCmd {
    Subscribe {
        filter: Filter,
        tx: mpsc::Sender<(Topic, Payload)>,
        resp: Resp<()>,
    },
    Publish {
        topic: Topic,
        payload: Payload,
    },
    PeerLocal {
        remote: CoreHandle,
        resp: Resp<()>,
    },
    PeerRemote {
        network: NetworkInfo,
        retry: Duration,
        resp: Resp<()>,
    },
    Unpeer {
        peer: EndpointId,
        resp: Resp<()>,
    },
    AttachMaster {
        name: String,
        backend: BackendType,
        options: BackendOptions,
        resp: Resp<StoreFrontend>,
    },
    AttachClone {
        name: String,
        resp: Resp<StoreFrontend>,
    },
    LookupMaster {
        name: String,
        resp: Resp<MasterRef>,
    },
    ListPeers {
        resp: oneshot::Sender<Vec<PeerEntry>>,
    },
    GetFilter {
        resp: oneshot::Sender<Filter>,
    },
    PeerMsg {
        from: CoreHandle,
        msg: PeerMessage,
    },
    ConnOpened {
        conn: ConnHandle,
        network: Option<NetworkInfo>,
        /// Stops the reconnect supervisor on explicit unpeer.
        stop: Option<mpsc::Sender<()>>,
    },
    CloneResolved {
        name: String,
        requests: Vec<u64>,
        result: Result<EndpointId, FabricError>,
        resp: Resp<StoreFrontend>,
    },
}

/// Where a peer message physically came from.
enum MsgOrigin {
    Local(CoreHandle),
    Conn(ConnId),
}

/// How to reach a peer: directly into another in-process core, or through
/// a connection's writer task.
#[derive(Clone)]
pub(crate) enum PeerRoute {
    Local { remote: CoreHandle, origin: CoreHandle },
    Remote(ConnHandle),
}

impl PeerRoute {
    pub async fn send(&self, msg: PeerMessage) -> Result<(), FabricError> {
        match self {
            PeerRoute::Local { remote, origin } => remote
                .tx
                .send(CoreCmd::PeerMsg {
                    from: origin.clone(),
                    msg,
                })
                .await
                .map_err(|_| FabricError::ChannelClosed),
            PeerRoute::Remote(conn) => {
                conn.send(msg).await.map_err(|_| FabricError::ChannelClosed)
            }
        }
    }
}

/// Snapshot of one peer's lifecycle state, for introspection.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub info: EndpointInfo,
    pub phase: PeerPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    Pending,
    Connected,
}

struct PeerState {
    info: EndpointInfo,
    route: PeerRoute,
    phase: PeerPhase,
    initiated_by_us: bool,
}

/// Cheap, cloneable handle to one core actor.
#[derive(Clone)]
pub struct CoreHandle {
    pub(crate) tx: mpsc::Sender<CoreCmd>,
    conn_tx: mpsc::Sender<ConnEvent>,
    info: EndpointInfo,
}

impl std::fmt::Debug for CoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreHandle").field("id", &self.info.id).finish()
    }
}

impl CoreHandle {
    pub fn id(&self) -> EndpointId {
        self.info.id
    }

    pub fn info(&self) -> &EndpointInfo {
        &self.info
    }

    /// The channel connection reader tasks deliver into.
    pub(crate) fn conn_ingest(&self) -> mpsc::Sender<ConnEvent> {
        self.conn_tx.clone()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Resp<T>) -> CoreCmd,
    ) -> Result<T, FabricError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .await
            .map_err(|_| FabricError::ChannelClosed)?;
        rx.await.map_err(|_| FabricError::ChannelClosed)?
    }

    /// Add a local subscriber lane and grow the endpoint filter.
    pub async fn subscribe_lane(
        &self,
        filter: Filter,
        tx: mpsc::Sender<(Topic, Payload)>,
    ) -> Result<(), FabricError> {
        self.request(|resp| CoreCmd::Subscribe { filter, tx, resp }).await
    }

    /// Initiate peering with another in-process core (handshake step #0).
    pub async fn peer_with(&self, remote: CoreHandle) -> Result<(), FabricError> {
        self.request(|resp| CoreCmd::PeerLocal { remote, resp }).await
    }

    /// Initiate remote peering; a supervisor keeps reconnecting every
    /// `retry` until told otherwise (zero means a single attempt).
    pub async fn peer_remotely(
        &self,
        network: NetworkInfo,
        retry: Duration,
    ) -> Result<(), FabricError> {
        self.request(|resp| CoreCmd::PeerRemote { network, retry, resp }).await
    }

    pub async fn unpeer(&self, peer: EndpointId) -> Result<(), FabricError> {
        self.request(|resp| CoreCmd::Unpeer { peer, resp }).await
    }

    pub async fn publish(&self, topic: Topic, data: Data) -> Result<(), FabricError> {
        self.publish_payload(topic, Payload::User(data)).await
    }

    pub(crate) async fn publish_payload(
        &self,
        topic: Topic,
        payload: Payload,
    ) -> Result<(), FabricError> {
        self.tx
            .send(CoreCmd::Publish { topic, payload })
            .await
            .map_err(|_| FabricError::ChannelClosed)
    }

    pub async fn attach_master(
        &self,
        name: impl Into<String>,
        backend: BackendType,
        options: BackendOptions,
    ) -> Result<StoreFrontend, FabricError> {
        let name = name.into();
        self.request(|resp| CoreCmd::AttachMaster {
            name,
            backend,
            options,
            resp,
        })
        .await
    }

    pub async fn attach_clone(
        &self,
        name: impl Into<String>,
    ) -> Result<StoreFrontend, FabricError> {
        let name = name.into();
        self.request(|resp| CoreCmd::AttachClone { name, resp }).await
    }

    pub async fn lookup_master(
        &self,
        name: impl Into<String>,
    ) -> Result<MasterRef, FabricError> {
        let name = name.into();
        self.request(|resp| CoreCmd::LookupMaster { name, resp }).await
    }

    /// Current peer table, for introspection and tests.
    pub async fn peers(&self) -> Result<Vec<PeerEntry>, FabricError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CoreCmd::ListPeers { resp: tx })
            .await
            .map_err(|_| FabricError::ChannelClosed)?;
        rx.await.map_err(|_| FabricError::ChannelClosed)
    }

    /// Current endpoint filter, for introspection and tests.
    pub async fn filter(&self) -> Result<Filter, FabricError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CoreCmd::GetFilter { resp: tx })
            .await
            .map_err(|_| FabricError::ChannelClosed)?;
        rx.await.map_err(|_| FabricError::ChannelClosed)
    }

    /// Deliver a peer frame as if it arrived from `from`. This is the
    /// ingress local peers use; exposed so protocol behavior can be
    /// exercised directly.
    pub async fn peer_message(
        &self,
        from: &CoreHandle,
        msg: PeerMessage,
    ) -> Result<(), FabricError> {
        self.tx
            .send(CoreCmd::PeerMsg {
                from: from.clone(),
                msg,
            })
            .await
            .map_err(|_| FabricError::ChannelClosed)
    }
}

#[cfg(test)]
impl CoreHandle {
    /// A handle whose mailbox the test owns; no actor behind it.
    pub(crate) fn stub(
        info: EndpointInfo,
        tx: mpsc::Sender<CoreCmd>,
        conn_tx: mpsc::Sender<ConnEvent>,
    ) -> Self {
        CoreHandle { tx, conn_tx, info }
    }
}

/// Spawn one core actor. Returns its handle plus the outgoing and incoming
/// status queues.
pub fn spawn_core(cfg: CoreConfig) -> (CoreHandle, StatusReceiver, StatusReceiver) {
    let id = EndpointId::new_v4();
    let (tx, cmd_rx) = mpsc::channel(CORE_MAILBOX);
    let (conn_tx, conn_rx) = mpsc::channel(CORE_MAILBOX);
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();

    let handle = CoreHandle {
        tx,
        conn_tx,
        info: EndpointInfo::new(id),
    };

    let core = Core {
        handle: handle.clone(),
        cfg: cfg.clone(),
        filter: Filter::new(),
        governor: Governor::new(cfg.queue_limit),
        peers: HashMap::new(),
        pending_outbound: HashMap::new(),
        conns: HashMap::new(),
        conn_peers: HashMap::new(),
        supervised: HashSet::new(),
        supervisor_stops: HashMap::new(),
        masters: HashMap::new(),
        clones: HashMap::new(),
        resolved_masters: HashMap::new(),
        resolver_waits: HashMap::new(),
        next_stream: 1,
        next_request: 1,
        next_local: 1,
        out_status: out_tx,
        in_status: in_tx,
    };
    tokio::spawn(core.run(cmd_rx, conn_rx));

    (handle, out_rx, in_rx)
}

struct Core {
    handle: CoreHandle,
    cfg: CoreConfig,
    filter: Filter,
    governor: Governor,
    peers: HashMap<EndpointId, PeerState>,
    /// Outbound connections awaiting the remote's step #2 reply.
    pending_outbound: HashMap<ConnId, NetworkInfo>,
    conns: HashMap<ConnId, ConnHandle>,
    conn_peers: HashMap<ConnId, EndpointId>,
    /// Connections whose loss a reconnect supervisor reports.
    supervised: HashSet<ConnId>,
    /// Per-supervised-connection handles that stop the supervisor.
    supervisor_stops: HashMap<ConnId, mpsc::Sender<()>>,
    masters: HashMap<String, MasterHandle>,
    clones: HashMap<String, CloneHandle>,
    /// Store names resolved to a remote master's endpoint.
    resolved_masters: HashMap<String, EndpointId>,
    /// In-flight resolver probes, keyed by request id.
    resolver_waits: HashMap<u64, mpsc::UnboundedSender<(EndpointId, bool)>>,
    next_stream: u64,
    next_request: u64,
    next_local: u64,
    out_status: StatusSender,
    in_status: StatusSender,
}

impl Core {
    fn id(&self) -> EndpointId {
        self.handle.id()
    }

    fn next_stream_id(&mut self) -> StreamId {
        let sid = StreamId(self.next_stream);
        self.next_stream += 1;
        sid
    }

    fn next_local_id(&mut self) -> u64 {
        let id = self.next_local;
        self.next_local += 1;
        id
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<CoreCmd>,
        mut conn_rx: mpsc::Receiver<ConnEvent>,
    ) {
        loop {
            tokio::select! {
                Some(cmd) = cmd_rx.recv() => self.handle_cmd(cmd).await,
                Some(event) = conn_rx.recv() => self.handle_conn_event(event).await,
                else => break,
            }
        }
    }

    async fn handle_cmd(&mut self, cmd: CoreCmd) {
        match cmd {
            CoreCmd::Subscribe { filter, tx, resp } => {
                let _ = resp.send(self.subscribe(filter, tx).await);
            }
            CoreCmd::Publish { topic, payload } => {
                self.governor.push(&topic, &payload, None).await;
            }
            CoreCmd::PeerLocal { remote, resp } => {
                let _ = resp.send(self.peer_local(remote).await);
            }
            CoreCmd::PeerRemote { network, retry, resp } => {
                let _ = resp.send(self.peer_remote(network, retry));
            }
            CoreCmd::Unpeer { peer, resp } => {
                let _ = resp.send(self.unpeer(peer).await);
            }
            CoreCmd::AttachMaster {
                name,
                backend,
                options,
                resp,
            } => {
                let _ = resp.send(self.attach_master(name, backend, options).await);
            }
            CoreCmd::AttachClone { name, resp } => self.attach_clone(name, resp).await,
            CoreCmd::LookupMaster { name, resp } => {
                let _ = resp.send(self.lookup_master(&name));
            }
            CoreCmd::ListPeers { resp } => {
                let entries = self
                    .peers
                    .values()
                    .map(|p| PeerEntry {
                        info: p.info.clone(),
                        phase: p.phase,
                    })
                    .collect();
                let _ = resp.send(entries);
            }
            CoreCmd::GetFilter { resp } => {
                let _ = resp.send(self.filter.clone());
            }
            CoreCmd::PeerMsg { from, msg } => {
                self.handle_peer_message(MsgOrigin::Local(from), msg).await;
            }
            CoreCmd::ConnOpened { conn, network, stop } => {
                self.conn_opened(conn, network, stop).await;
            }
            CoreCmd::CloneResolved {
                name,
                requests,
                result,
                resp,
            } => {
                for request in requests {
                    self.resolver_waits.remove(&request);
                }
                match result {
                    Ok(peer) => {
                        self.resolved_masters.insert(name.clone(), peer);
                        let frontend = self.spawn_clone(name).await;
                        let _ = resp.send(Ok(frontend));
                    }
                    Err(e) => {
                        let _ = resp.send(Err(e));
                    }
                }
            }
        }
    }

    async fn handle_conn_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Message(id, msg) => {
                self.handle_peer_message(MsgOrigin::Conn(id), msg).await;
            }
            ConnEvent::Closed(id) => self.conn_closed(id).await,
        }
    }

    // ---- local operations ---------------------------------------------------

    async fn subscribe(
        &mut self,
        filter: Filter,
        tx: mpsc::Sender<(Topic, Payload)>,
    ) -> Result<(), FabricError> {
        if tx.is_closed() {
            return Err(FabricError::CannotAddDownstream);
        }
        let id = self.next_local_id();
        self.governor.add_local(id, filter.clone(), tx);
        self.add_to_filter(filter.iter().cloned().collect::<Vec<_>>()).await;
        Ok(())
    }

    async fn peer_local(&mut self, remote: CoreHandle) -> Result<(), FabricError> {
        if remote.id() == self.id() {
            return Err(FabricError::InvalidArgument("cannot peer with self".into()));
        }
        if let Some(existing) = self.peers.get(&remote.id()) {
            tracing::debug!(peer = %remote.id(), phase = ?existing.phase, "already peering");
            return Ok(());
        }
        let route = PeerRoute::Local {
            remote: remote.clone(),
            origin: self.handle.clone(),
        };
        self.peers.insert(
            remote.id(),
            PeerState {
                info: remote.info().clone(),
                route: route.clone(),
                phase: PeerPhase::Pending,
                initiated_by_us: true,
            },
        );
        emit(
            &self.out_status,
            remote.info().clone(),
            StatusKind::Initializing,
            "handshake started",
        );
        let init = PeerMessage::PeerInit {
            version: WIRE_VERSION,
            filter: self.filter.clone(),
            origin: self.handle.info().clone(),
        };
        if route.send(init).await.is_err() {
            self.drop_peer(remote.id(), StatusKind::Invalid, "peer core unreachable");
        }
        Ok(())
    }

    fn peer_remote(&mut self, network: NetworkInfo, retry: Duration) -> Result<(), FabricError> {
        if network.host.is_empty() {
            return Err(FabricError::InvalidArgument("empty host".into()));
        }
        supervisor::spawn_supervisor(
            self.handle.clone(),
            network,
            retry,
            self.out_status.clone(),
        );
        Ok(())
    }

    async fn unpeer(&mut self, peer: EndpointId) -> Result<(), FabricError> {
        let Some(state) = self.peers.get(&peer) else {
            return Err(FabricError::InvalidArgument("unknown peer".into()));
        };
        let _ = state.route.send(PeerMessage::Unpeer).await;
        self.drop_peer(peer, StatusKind::Disconnected, "unpeered");
        Ok(())
    }

    /// Union new entries into the filter; on growth, broadcast the new
    /// filter to every connected peer.
    async fn add_to_filter(&mut self, entries: impl IntoIterator<Item = Topic>) {
        if !self.filter.extend(entries) {
            return;
        }
        tracing::debug!(endpoint = %self.id(), filter = ?self.filter, "filter changed");
        let update = PeerMessage::FilterUpdate {
            filter: self.filter.clone(),
        };
        for route in self.governor.ready_routes() {
            let _ = route.send(update.clone()).await;
        }
    }

    // ---- connections --------------------------------------------------------

    async fn conn_opened(
        &mut self,
        conn: ConnHandle,
        network: Option<NetworkInfo>,
        stop: Option<mpsc::Sender<()>>,
    ) {
        let route = PeerRoute::Remote(conn.clone());
        let conn_id = conn.id;
        self.conns.insert(conn_id, conn);
        if let Some(stop) = stop {
            self.supervised.insert(conn_id);
            self.supervisor_stops.insert(conn_id, stop);
        }
        if let Some(network) = network {
            // Outbound: we initiate the handshake over the fresh socket.
            self.pending_outbound.insert(conn_id, network);
            let init = PeerMessage::PeerInit {
                version: WIRE_VERSION,
                filter: self.filter.clone(),
                origin: self.handle.info().clone(),
            };
            let _ = route.send(init).await;
        }
    }

    async fn conn_closed(&mut self, conn_id: ConnId) {
        self.conns.remove(&conn_id);
        self.pending_outbound.remove(&conn_id);
        self.supervisor_stops.remove(&conn_id);
        let supervised = self.supervised.remove(&conn_id);
        if let Some(peer) = self.conn_peers.remove(&conn_id) {
            if supervised {
                // The reconnect supervisor reports this loss on the
                // outgoing queue; avoid a duplicate event.
                if let Some(state) = self.peers.remove(&peer) {
                    self.governor.remove_peer(peer);
                    tracing::debug!(peer = %state.info.id, "supervised connection lost");
                }
            } else {
                self.drop_peer(peer, StatusKind::Disconnected, "connection lost");
            }
        }
    }

    /// Remove all state for a peer and surface one status event. Remote
    /// peers also lose their connection and reconnect supervisor.
    fn drop_peer(&mut self, peer: EndpointId, kind: StatusKind, reason: &str) {
        let Some(state) = self.peers.remove(&peer) else {
            return;
        };
        self.governor.remove_peer(peer);
        if let PeerRoute::Remote(conn) = &state.route {
            self.conn_peers.remove(&conn.id);
            self.conns.remove(&conn.id);
            self.supervised.remove(&conn.id);
            if let Some(stop) = self.supervisor_stops.remove(&conn.id) {
                let _ = stop.try_send(());
            }
        }
        let queue = if state.initiated_by_us {
            &self.out_status
        } else {
            &self.in_status
        };
        emit(queue, state.info, kind, reason);
    }

    // ---- the 3-way handshake ------------------------------------------------

    async fn handle_peer_message(&mut self, origin: MsgOrigin, msg: PeerMessage) {
        match msg {
            PeerMessage::PeerInit {
                version,
                filter,
                origin: info,
            } => self.on_peer_init(origin, version, filter, info).await,
            PeerMessage::PeerOpen {
                stream,
                filter,
                origin: info,
            } => self.on_peer_open(origin, stream, filter, info).await,
            PeerMessage::PeerAck { stream } => self.on_peer_ack(origin, stream).await,
            PeerMessage::FilterUpdate { filter } => {
                let Some(peer) = self.sender_id(&origin) else {
                    tracing::debug!("filter update from unknown sender, dropping");
                    return;
                };
                if !self.governor.update_peer(peer, filter) {
                    tracing::debug!(peer = %peer, "filter update for unknown lane, dropping");
                }
            }
            PeerMessage::Publish { topic, payload } => {
                self.on_publish(origin, topic, payload).await;
            }
            PeerMessage::Credit { stream, amount } => {
                let Some(peer) = self.sender_id(&origin) else {
                    return;
                };
                let outgoing = self.governor.peer(peer).map(|lane| lane.outgoing);
                match outgoing {
                    Some(expected) if expected == stream => {
                        self.governor.grant_credit(peer, amount).await;
                    }
                    Some(expected) => {
                        tracing::warn!(
                            peer = %peer,
                            got = %stream,
                            expected = %expected,
                            "credit for mismatched stream, dropping"
                        );
                    }
                    None => {}
                }
            }
            PeerMessage::MasterQuery { name, request } => {
                let found = self.masters.contains_key(&name);
                if let Some(route) = self.origin_route(&origin) {
                    let _ = route.send(PeerMessage::MasterReply { request, found }).await;
                }
            }
            PeerMessage::MasterReply { request, found } => {
                let Some(peer) = self.sender_id(&origin) else {
                    return;
                };
                if let Some(results) = self.resolver_waits.get(&request) {
                    if results.send((peer, found)).is_err() {
                        self.resolver_waits.remove(&request);
                    }
                }
            }
            PeerMessage::Unpeer => {
                let Some(peer) = self.sender_id(&origin) else {
                    return;
                };
                self.drop_peer(peer, StatusKind::Disconnected, "unpeered by remote");
            }
        }
    }

    /// Step #1: a peer demands we establish a stream back to it.
    async fn on_peer_init(
        &mut self,
        origin: MsgOrigin,
        version: u32,
        filter: Filter,
        info: EndpointInfo,
    ) {
        let Some(route) = self.origin_route(&origin) else {
            return;
        };
        if info.is_anonymous() {
            tracing::debug!("dropping anonymous peering request");
            emit(
                &self.in_status,
                info,
                StatusKind::Invalid,
                "anonymous peering request",
            );
            return;
        }
        if version != WIRE_VERSION {
            tracing::warn!(peer = %info.id, version, "incompatible peer version");
            emit(
                &self.in_status,
                info,
                StatusKind::Incompatible,
                format!("wire version {version}, expected {WIRE_VERSION}"),
            );
            return;
        }
        if let Some(existing) = self.peers.get(&info.id) {
            match existing.phase {
                PeerPhase::Connected => {
                    tracing::warn!(peer = %info.id, "peering request from connected peer, dropping");
                    return;
                }
                PeerPhase::Pending if !existing.initiated_by_us => {
                    tracing::warn!(peer = %info.id, "repeated handshake step #1, dropping");
                    return;
                }
                PeerPhase::Pending => {
                    // Both sides called peer() at once. The smaller id
                    // stays initiator; the other side yields and answers.
                    if self.id() < info.id {
                        tracing::debug!(peer = %info.id, "crossed handshake, staying initiator");
                        return;
                    }
                    tracing::debug!(peer = %info.id, "crossed handshake, yielding to peer");
                    self.peers.remove(&info.id);
                    self.governor.remove_peer(info.id);
                }
            }
        }
        let stream = self.next_stream_id();
        self.governor.add_peer(info.id, route.clone(), stream, filter);
        self.peers.insert(
            info.id,
            PeerState {
                info: info.clone(),
                route: route.clone(),
                phase: PeerPhase::Pending,
                initiated_by_us: false,
            },
        );
        if let MsgOrigin::Conn(conn_id) = origin {
            self.conn_peers.insert(conn_id, info.id);
        }
        emit(
            &self.in_status,
            info,
            StatusKind::Initializing,
            "handshake step #1",
        );
        let open = PeerMessage::PeerOpen {
            stream,
            filter: self.filter.clone(),
            origin: self.handle.info().clone(),
        };
        let _ = route.send(open).await;
    }

    /// Step #2: the responder opened its stream; open ours and ack.
    async fn on_peer_open(
        &mut self,
        origin: MsgOrigin,
        remote_stream: StreamId,
        filter: Filter,
        info: EndpointInfo,
    ) {
        let Some(route) = self.origin_route(&origin) else {
            return;
        };
        if info.is_anonymous() {
            tracing::debug!("dropping anonymous handshake step #2");
            return;
        }
        match &origin {
            MsgOrigin::Local(_) => {
                match self.peers.get(&info.id) {
                    Some(state)
                        if state.phase == PeerPhase::Pending && state.initiated_by_us => {}
                    Some(_) => {
                        tracing::warn!(peer = %info.id, "repeated handshake step #2, dropping");
                        return;
                    }
                    None => {
                        tracing::warn!(peer = %info.id, "unexpected handshake step #2, dropping");
                        return;
                    }
                }
            }
            MsgOrigin::Conn(conn_id) => {
                let Some(network) = self.pending_outbound.remove(conn_id) else {
                    tracing::warn!(peer = %info.id, "unexpected handshake step #2, dropping");
                    return;
                };
                if self
                    .peers
                    .get(&info.id)
                    .is_some_and(|p| p.phase == PeerPhase::Connected)
                {
                    tracing::warn!(peer = %info.id, "already connected to peer, dropping step #2");
                    return;
                }
                self.peers.insert(
                    info.id,
                    PeerState {
                        info: EndpointInfo::with_network(info.id, network),
                        route: route.clone(),
                        phase: PeerPhase::Pending,
                        initiated_by_us: true,
                    },
                );
                self.conn_peers.insert(*conn_id, info.id);
            }
        }

        let stream = self.next_stream_id();
        self.governor.add_peer(info.id, route.clone(), stream, filter);
        // Install the incoming handler for the peer's stream.
        if let Some(lane) = self.governor.peer_mut(info.id) {
            lane.incoming = Some(remote_stream);
            lane.ready = true;
        }
        if let Some(state) = self.peers.get_mut(&info.id) {
            state.phase = PeerPhase::Connected;
        }

        let _ = route.send(PeerMessage::PeerAck { stream }).await;
        let _ = route
            .send(PeerMessage::FilterUpdate {
                filter: self.filter.clone(),
            })
            .await;
        let _ = route
            .send(PeerMessage::Credit {
                stream: remote_stream,
                amount: self.cfg.credit_window,
            })
            .await;

        let peer_info = self
            .peers
            .get(&info.id)
            .map(|p| p.info.clone())
            .unwrap_or(info);
        emit(
            &self.out_status,
            peer_info,
            StatusKind::Established,
            "handshake complete",
        );
    }

    /// Step #3: the initiator opened its stream; the peering is up.
    async fn on_peer_ack(&mut self, origin: MsgOrigin, remote_stream: StreamId) {
        let Some(peer) = self.sender_id(&origin) else {
            tracing::warn!("handshake step #3 from unknown sender, dropping");
            return;
        };
        match self.peers.get_mut(&peer) {
            Some(state) if state.phase == PeerPhase::Pending && !state.initiated_by_us => {
                state.phase = PeerPhase::Connected;
            }
            _ => {
                tracing::warn!(peer = %peer, "step #3 without a prior step #1, dropping");
                return;
            }
        }
        let Some(lane) = self.governor.peer_mut(peer) else {
            tracing::warn!(peer = %peer, "no lane for acked peer, dropping");
            return;
        };
        lane.incoming = Some(remote_stream);
        lane.ready = true;
        let route = lane.route.clone();

        let _ = route
            .send(PeerMessage::FilterUpdate {
                filter: self.filter.clone(),
            })
            .await;
        let _ = route
            .send(PeerMessage::Credit {
                stream: remote_stream,
                amount: self.cfg.credit_window,
            })
            .await;

        let info = self
            .peers
            .get(&peer)
            .map(|p| p.info.clone())
            .unwrap_or_else(|| EndpointInfo::new(peer));
        emit(
            &self.in_status,
            info,
            StatusKind::Established,
            "handshake complete",
        );
    }

    /// A publish arrived from a peer: account credit, deliver locally, and
    /// forward everywhere except back along the reverse path.
    async fn on_publish(&mut self, origin: MsgOrigin, topic: Topic, payload: Payload) {
        let Some(peer) = self.sender_id(&origin) else {
            tracing::warn!(topic = %topic, "publish from unknown peer, dropping");
            return;
        };
        let window = self.cfg.credit_window;
        let mut grant = None;
        match self.governor.peer_mut(peer) {
            Some(lane) if lane.ready => {
                lane.consumed += 1;
                if lane.consumed >= window.max(2) / 2 {
                    if let Some(incoming) = lane.incoming {
                        grant = Some((
                            lane.route.clone(),
                            PeerMessage::Credit {
                                stream: incoming,
                                amount: lane.consumed,
                            },
                        ));
                        lane.consumed = 0;
                    }
                }
            }
            _ => {
                tracing::warn!(peer = %peer, topic = %topic, "publish before handshake completed, dropping");
                return;
            }
        }
        if let Some((route, credit)) = grant {
            let _ = route.send(credit).await;
        }
        self.governor.push(&topic, &payload, Some(peer)).await;
    }

    fn sender_id(&self, origin: &MsgOrigin) -> Option<EndpointId> {
        match origin {
            MsgOrigin::Local(handle) => Some(handle.id()),
            MsgOrigin::Conn(conn_id) => self.conn_peers.get(conn_id).copied(),
        }
    }

    fn origin_route(&self, origin: &MsgOrigin) -> Option<PeerRoute> {
        match origin {
            MsgOrigin::Local(handle) => Some(PeerRoute::Local {
                remote: handle.clone(),
                origin: self.handle.clone(),
            }),
            MsgOrigin::Conn(conn_id) => self
                .conns
                .get(conn_id)
                .map(|conn| PeerRoute::Remote(conn.clone())),
        }
    }

    // ---- data stores --------------------------------------------------------

    async fn attach_master(
        &mut self,
        name: String,
        backend: BackendType,
        options: BackendOptions,
    ) -> Result<StoreFrontend, FabricError> {
        if let Some(handle) = self.masters.get(&name) {
            tracing::debug!(store = %name, "found local master");
            return Ok(StoreFrontend::for_master(
                name,
                handle.clone(),
                self.handle.clone(),
            ));
        }
        let master_topic = store_master_topic(&name);
        // A propagated subscription to the master topic means a remote
        // master already serves this name.
        if self.governor.any_peer_filter_has(&master_topic) {
            tracing::warn!(store = %name, "remote master with same name exists already");
            return Err(FabricError::MasterExists);
        }
        let engine = open_backend(backend, options)
            .map_err(|e| FabricError::BackendFailure(e.to_string()))?;

        let (lane_tx, lane_rx) = mpsc::channel(self.cfg.subscriber_capacity);
        let lane_id = self.next_local_id();
        self.governor.add_local(
            lane_id,
            std::iter::once(master_topic.clone()).collect(),
            lane_tx,
        );
        let handle = master::spawn_master(name.clone(), engine, self.handle.clone(), lane_rx);
        self.masters.insert(name.clone(), handle.clone());
        self.add_to_filter([master_topic]).await;
        tracing::debug!(store = %name, "master attached");
        Ok(StoreFrontend::for_master(name, handle, self.handle.clone()))
    }

    async fn attach_clone(&mut self, name: String, resp: Resp<StoreFrontend>) {
        if self.clones.contains_key(&name)
            || self.masters.contains_key(&name)
            || self.resolved_masters.contains_key(&name)
        {
            let frontend = self.spawn_clone(name).await;
            let _ = resp.send(Ok(frontend));
            return;
        }
        let targets = self.governor.ready_peers();
        if targets.is_empty() {
            tracing::debug!(store = %name, "no peers to ask for the master");
            let _ = resp.send(Err(FabricError::NoSuchMaster));
            return;
        }
        // Probe every peer in parallel; a short-lived resolver collects
        // the replies and reports back.
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let mut requests = Vec::with_capacity(targets.len());
        for (_, route) in &targets {
            let request = self.next_request;
            self.next_request += 1;
            self.resolver_waits.insert(request, results_tx.clone());
            let _ = route
                .send(PeerMessage::MasterQuery {
                    name: name.clone(),
                    request,
                })
                .await;
            requests.push(request);
        }
        resolver::spawn_resolver(
            self.handle.clone(),
            name,
            requests,
            results_rx,
            targets.len(),
            self.cfg.resolver_timeout,
            resp,
        );
    }

    /// Install the clone actor and its lane, then ask the master for a
    /// bootstrap snapshot.
    async fn spawn_clone(&mut self, name: String) -> StoreFrontend {
        if let Some(handle) = self.clones.get(&name) {
            return StoreFrontend::for_clone(name, handle.clone(), self.handle.clone());
        }
        let clone_topic = store_clone_topic(&name);
        let (lane_tx, lane_rx) = mpsc::channel(self.cfg.subscriber_capacity);
        let lane_id = self.next_local_id();
        self.governor
            .add_local(lane_id, std::iter::once(clone_topic.clone()).collect(), lane_tx);
        let handle = clone_actor::spawn_clone(name.clone(), self.handle.clone(), lane_rx);
        self.clones.insert(name.clone(), handle.clone());
        self.add_to_filter([clone_topic]).await;

        let request = Payload::Command(StoreCommand::Snapshot {
            requester: self.id(),
        });
        self.governor
            .push(&store_master_topic(&name), &request, None)
            .await;
        tracing::debug!(store = %name, "clone attached");
        StoreFrontend::for_clone(name, handle, self.handle.clone())
    }

    fn lookup_master(&self, name: &str) -> Result<MasterRef, FabricError> {
        if let Some(handle) = self.masters.get(name) {
            return Ok(MasterRef::Local(handle.clone()));
        }
        if let Some(peer) = self.resolved_masters.get(name) {
            return Ok(MasterRef::Remote(*peer));
        }
        Err(FabricError::NoSuchMaster)
    }
}
