//! Clone actor - a local replica of one named store
//!
//! Bootstraps from a master snapshot, then applies replication updates in
//! sequence order. A gap in the sequence means missed updates; the clone
//! re-requests a snapshot instead of guessing. Stale updates (at or below
//! the replica's sequence) are ignored, so the replica always equals the
//! master's state at some past sequence number.

use tokio::sync::{mpsc, oneshot};
use weft_model::{
    store_master_topic, Data, FabricError, Payload, SequenceNum, StoreCommand, Topic, UpdateOp,
};
use weft_store::{Backend, MemoryBackend};

use crate::core_actor::CoreHandle;

const CLONE_MAILBOX: usize = 64;

pub(crate) enum CloneCmd {
    Get {
        key: Data,
        resp: oneshot::Sender<Result<Option<Data>, FabricError>>,
    },
    Exists {
        key: Data,
        resp: oneshot::Sender<Result<bool, FabricError>>,
    },
    Keys {
        resp: oneshot::Sender<Result<Vec<Data>, FabricError>>,
    },
    Size {
        resp: oneshot::Sender<Result<u64, FabricError>>,
    },
    Sequence {
        resp: oneshot::Sender<SequenceNum>,
    },
}

/// Handle to one clone actor.
#[derive(Clone)]
pub struct CloneHandle {
    pub(crate) tx: mpsc::Sender<CloneCmd>,
}

impl std::fmt::Debug for CloneHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloneHandle").finish()
    }
}

pub(crate) fn spawn_clone(
    name: String,
    core: CoreHandle,
    lane_rx: mpsc::Receiver<(Topic, Payload)>,
) -> CloneHandle {
    let (tx, cmd_rx) = mpsc::channel(CLONE_MAILBOX);
    let actor = CloneActor {
        master_topic: store_master_topic(&name),
        name,
        core,
        replica: MemoryBackend::new(),
        initialized: false,
        awaiting_snapshot: true,
    };
    tokio::spawn(actor.run(cmd_rx, lane_rx));
    CloneHandle { tx }
}

struct CloneActor {
    name: String,
    core: CoreHandle,
    replica: MemoryBackend,
    master_topic: Topic,
    /// A snapshot has been loaded; updates may apply.
    initialized: bool,
    /// A snapshot request is in flight; avoid re-asking per update.
    awaiting_snapshot: bool,
}

fn backend_failure(e: weft_store::BackendError) -> FabricError {
    FabricError::BackendFailure(e.to_string())
}

impl CloneActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<CloneCmd>,
        mut lane_rx: mpsc::Receiver<(Topic, Payload)>,
    ) {
        loop {
            tokio::select! {
                Some(cmd) = cmd_rx.recv() => self.handle_cmd(cmd),
                Some((_, payload)) = lane_rx.recv() => {
                    if let Payload::Command(cmd) = payload {
                        self.handle_replication(cmd).await;
                    }
                }
                else => break,
            }
        }
    }

    fn handle_cmd(&mut self, cmd: CloneCmd) {
        match cmd {
            CloneCmd::Get { key, resp } => {
                let _ = resp.send(self.replica.lookup(&key).map_err(backend_failure));
            }
            CloneCmd::Exists { key, resp } => {
                let _ = resp.send(self.replica.exists(&key).map_err(backend_failure));
            }
            CloneCmd::Keys { resp } => {
                let _ = resp.send(self.replica.keys().map_err(backend_failure));
            }
            CloneCmd::Size { resp } => {
                let _ = resp.send(self.replica.size().map_err(backend_failure));
            }
            CloneCmd::Sequence { resp } => {
                let _ = resp.send(self.replica.sequence());
            }
        }
    }

    async fn handle_replication(&mut self, cmd: StoreCommand) {
        match cmd {
            StoreCommand::SnapshotReply { target, snapshot } => {
                if target != self.core.id() {
                    // Addressed to another endpoint's clone.
                    return;
                }
                let seq = snapshot.seq;
                if let Err(e) = self.replica.init(snapshot) {
                    tracing::warn!(store = %self.name, error = %e, "cannot load snapshot");
                    return;
                }
                self.initialized = true;
                self.awaiting_snapshot = false;
                tracing::debug!(store = %self.name, seq, "snapshot loaded");
            }
            StoreCommand::Update { seq, op } => {
                if !self.initialized {
                    self.request_snapshot().await;
                    return;
                }
                let current = self.replica.sequence();
                if seq == current + 1 {
                    self.apply_update(op);
                    self.replica.increase_sequence();
                } else if seq > current + 1 {
                    tracing::warn!(
                        store = %self.name,
                        have = current,
                        got = seq,
                        "update gap detected, requesting fresh snapshot"
                    );
                    self.request_snapshot().await;
                }
                // Stale updates are ignored.
            }
            _ => {}
        }
    }

    fn apply_update(&mut self, op: UpdateOp) {
        let result = match op {
            UpdateOp::Put { key, value, expiry } => self.replica.insert(key, value, expiry),
            UpdateOp::Erase { key } => self.replica.erase(&key),
            UpdateOp::Clear => self.replica.clear(),
        };
        if let Err(e) = result {
            tracing::warn!(store = %self.name, error = %e, "cannot apply update");
        }
    }

    async fn request_snapshot(&mut self) {
        if self.awaiting_snapshot {
            return;
        }
        self.awaiting_snapshot = true;
        let request = Payload::Command(StoreCommand::Snapshot {
            requester: self.core.id(),
        });
        if let Err(e) = self
            .core
            .publish_payload(self.master_topic.clone(), request)
            .await
        {
            tracing::warn!(store = %self.name, error = %e, "cannot request snapshot");
            self.awaiting_snapshot = false;
        }
    }
}
