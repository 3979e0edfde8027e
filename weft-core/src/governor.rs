//! Governor - the core's outbound multiplexer
//!
//! Owns one lane per peer and per local subscriber (subscribers, masters,
//! and clones all ride local lanes). A publish fans out to every lane whose
//! filter matches; peer lanes spend downstream-granted credit and buffer a
//! bounded queue when starved. A saturated lane blocks and drops further
//! traffic rather than stalling the publisher.

use crate::core_actor::PeerRoute;
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;
use weft_model::{EndpointId, Filter, Payload, PeerMessage, StreamId, Topic};

pub(crate) struct Governor {
    peers: HashMap<EndpointId, PeerLane>,
    locals: HashMap<u64, LocalLane>,
    queue_limit: usize,
}

/// Outbound lane to one peer.
pub(crate) struct PeerLane {
    pub route: PeerRoute,
    pub filter: Filter,
    /// Stream we send on; allocated by us, credit arrives against it.
    pub outgoing: StreamId,
    /// Stream the peer sends on; we grant credit against it.
    pub incoming: Option<StreamId>,
    /// Handshake completed; traffic may flow.
    pub ready: bool,
    /// Inbound messages consumed since the last credit grant.
    pub consumed: u32,
    credit: u32,
    queue: VecDeque<(Topic, Payload)>,
    blocked: bool,
}

struct LocalLane {
    filter: Filter,
    tx: mpsc::Sender<(Topic, Payload)>,
}

impl Governor {
    pub fn new(queue_limit: usize) -> Self {
        Governor {
            peers: HashMap::new(),
            locals: HashMap::new(),
            queue_limit,
        }
    }

    /// Install a lane for a new peer. Returns false if one already exists.
    pub fn add_peer(
        &mut self,
        id: EndpointId,
        route: PeerRoute,
        outgoing: StreamId,
        filter: Filter,
    ) -> bool {
        if self.peers.contains_key(&id) {
            return false;
        }
        self.peers.insert(
            id,
            PeerLane {
                route,
                filter,
                outgoing,
                incoming: None,
                ready: false,
                consumed: 0,
                credit: 0,
                queue: VecDeque::new(),
                blocked: false,
            },
        );
        true
    }

    pub fn remove_peer(&mut self, id: EndpointId) -> Option<PeerLane> {
        self.peers.remove(&id)
    }

    pub fn peer(&self, id: EndpointId) -> Option<&PeerLane> {
        self.peers.get(&id)
    }

    pub fn peer_mut(&mut self, id: EndpointId) -> Option<&mut PeerLane> {
        self.peers.get_mut(&id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Replace a peer's stored filter. Returns false for unknown peers.
    pub fn update_peer(&mut self, id: EndpointId, filter: Filter) -> bool {
        match self.peers.get_mut(&id) {
            Some(lane) => {
                lane.filter = filter;
                true
            }
            None => false,
        }
    }

    /// Routes of every handshake-complete peer.
    pub fn ready_routes(&self) -> Vec<PeerRoute> {
        self.peers
            .values()
            .filter(|lane| lane.ready)
            .map(|lane| lane.route.clone())
            .collect()
    }

    /// Ids and routes of every handshake-complete peer.
    pub fn ready_peers(&self) -> Vec<(EndpointId, PeerRoute)> {
        self.peers
            .iter()
            .filter(|(_, lane)| lane.ready)
            .map(|(id, lane)| (*id, lane.route.clone()))
            .collect()
    }

    /// True if any ready peer's filter carries exactly this entry.
    pub fn any_peer_filter_has(&self, entry: &Topic) -> bool {
        self.peers
            .values()
            .any(|lane| lane.ready && lane.filter.has_entry(entry))
    }

    pub fn add_local(&mut self, id: u64, filter: Filter, tx: mpsc::Sender<(Topic, Payload)>) {
        self.locals.insert(id, LocalLane { filter, tx });
    }

    /// Fan a message out to every matching lane, except the reverse path
    /// back to the originating peer.
    pub async fn push(&mut self, topic: &Topic, payload: &Payload, exclude: Option<EndpointId>) {
        let mut dead = Vec::new();
        for (id, lane) in &self.locals {
            if !lane.filter.matches(topic) {
                continue;
            }
            match lane.tx.try_send((topic.clone(), payload.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(topic = %topic, "local lane full, dropping message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
            }
        }
        for id in dead {
            self.locals.remove(&id);
        }

        for (id, lane) in self.peers.iter_mut() {
            if Some(*id) == exclude || !lane.ready || !lane.filter.matches(topic) {
                continue;
            }
            lane.dispatch(topic.clone(), payload.clone(), self.queue_limit)
                .await;
        }
    }

    /// Credit arrived for the stream we send on: top up and drain the
    /// backlog.
    pub async fn grant_credit(&mut self, id: EndpointId, amount: u32) {
        let Some(lane) = self.peers.get_mut(&id) else {
            return;
        };
        lane.credit = lane.credit.saturating_add(amount);
        while lane.credit > 0 {
            let Some((topic, payload)) = lane.queue.pop_front() else {
                break;
            };
            lane.credit -= 1;
            let _ = lane
                .route
                .send(PeerMessage::Publish { topic, payload })
                .await;
        }
        if lane.queue.is_empty() {
            lane.blocked = false;
        }
    }
}

impl PeerLane {
    async fn dispatch(&mut self, topic: Topic, payload: Payload, queue_limit: usize) {
        if self.blocked {
            tracing::warn!(topic = %topic, "lane blocked, dropping message");
            return;
        }
        if self.credit > 0 {
            self.credit -= 1;
            let _ = self.route.send(PeerMessage::Publish { topic, payload }).await;
        } else if self.queue.len() >= queue_limit {
            self.blocked = true;
            tracing::warn!(topic = %topic, "lane saturated, dropping message");
        } else {
            self.queue.push_back((topic, payload));
        }
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub(crate) fn is_blocked(&self) -> bool {
        self.blocked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_actor::{CoreCmd, CoreHandle};
    use weft_model::{Data, EndpointInfo};

    fn stub_route() -> (PeerRoute, mpsc::Receiver<CoreCmd>) {
        let (tx, rx) = mpsc::channel(256);
        let (conn_tx, _) = mpsc::channel(1);
        let remote = CoreHandle::stub(
            EndpointInfo::new(EndpointId::new_v4()),
            tx.clone(),
            conn_tx.clone(),
        );
        let origin = CoreHandle::stub(EndpointInfo::new(EndpointId::new_v4()), tx, conn_tx);
        (PeerRoute::Local { remote, origin }, rx)
    }

    fn drain_publishes(rx: &mut mpsc::Receiver<CoreCmd>) -> Vec<Topic> {
        let mut topics = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            if let CoreCmd::PeerMsg {
                msg: PeerMessage::Publish { topic, .. },
                ..
            } = cmd
            {
                topics.push(topic);
            }
        }
        topics
    }

    fn ready_lane(governor: &mut Governor, route: PeerRoute) -> EndpointId {
        let id = EndpointId::new_v4();
        governor.add_peer(id, route, StreamId(1), ["t"].into_iter().collect());
        let lane = governor.peer_mut(id).unwrap();
        lane.ready = true;
        id
    }

    #[tokio::test]
    async fn messages_wait_for_credit_and_keep_order() {
        let (route, mut rx) = stub_route();
        let mut governor = Governor::new(8);
        let id = ready_lane(&mut governor, route);

        let payload = Payload::User(Data::Integer(1));
        governor.push(&Topic::new("t/1"), &payload, None).await;
        governor.push(&Topic::new("t/2"), &payload, None).await;
        assert!(drain_publishes(&mut rx).is_empty());
        assert_eq!(governor.peer(id).unwrap().queued(), 2);

        governor.grant_credit(id, 5).await;
        let topics = drain_publishes(&mut rx);
        assert_eq!(topics, vec![Topic::new("t/1"), Topic::new("t/2")]);

        // Remaining credit dispatches immediately.
        governor.push(&Topic::new("t/3"), &payload, None).await;
        assert_eq!(drain_publishes(&mut rx), vec![Topic::new("t/3")]);
    }

    #[tokio::test]
    async fn saturated_lane_blocks_and_drops() {
        let (route, mut rx) = stub_route();
        let mut governor = Governor::new(2);
        let id = ready_lane(&mut governor, route);

        let payload = Payload::User(Data::Integer(1));
        for i in 0..4 {
            governor
                .push(&Topic::new(format!("t/{i}")), &payload, None)
                .await;
        }
        let lane = governor.peer(id).unwrap();
        assert!(lane.is_blocked());
        assert_eq!(lane.queued(), 2);

        // Credit drains the backlog and unblocks; the overflow is gone.
        governor.grant_credit(id, 10).await;
        assert_eq!(
            drain_publishes(&mut rx),
            vec![Topic::new("t/0"), Topic::new("t/1")]
        );
        assert!(!governor.peer(id).unwrap().is_blocked());
    }

    #[tokio::test]
    async fn non_matching_topics_are_never_enqueued() {
        let (route, _rx) = stub_route();
        let mut governor = Governor::new(8);
        let id = ready_lane(&mut governor, route);

        governor
            .push(&Topic::new("other"), &Payload::User(Data::None), None)
            .await;
        assert_eq!(governor.peer(id).unwrap().queued(), 0);
    }

    #[tokio::test]
    async fn reverse_path_is_excluded() {
        let (route, mut rx) = stub_route();
        let mut governor = Governor::new(8);
        let id = ready_lane(&mut governor, route);
        governor.grant_credit(id, 10).await;

        governor
            .push(&Topic::new("t/x"), &Payload::User(Data::None), Some(id))
            .await;
        assert!(drain_publishes(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn full_local_lane_drops_instead_of_blocking() {
        let mut governor = Governor::new(8);
        let (tx, mut rx) = mpsc::channel(1);
        governor.add_local(1, ["t"].into_iter().collect(), tx);

        let payload = Payload::User(Data::Integer(1));
        governor.push(&Topic::new("t/1"), &payload, None).await;
        governor.push(&Topic::new("t/2"), &payload, None).await;

        assert_eq!(rx.recv().await.map(|(t, _)| t), Some(Topic::new("t/1")));
        assert!(rx.try_recv().is_err());
    }
}
