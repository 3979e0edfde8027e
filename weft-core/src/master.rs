//! Master actor - authoritative state for one named store
//!
//! Owns the backend exclusively. Commands arrive from the local frontend
//! (with a reply channel) or from the fabric via the store's master topic
//! (fire-and-forget). Every successful mutation bumps the sequence number
//! and replicates a materialized update on the clone topic.
//!
//! Entries with an expiry duration get a timer task; the fired timer posts
//! an `Expire` command back, and the backend's equality guard makes stale
//! timers harmless.

use tokio::sync::{mpsc, oneshot};
use weft_model::{
    Data, ExpirationTime, FabricError, Payload, SequenceNum, StoreCommand, Timestamp, Topic,
    UpdateOp,
};
use weft_store::{Backend, BackendError, Modified};

use crate::core_actor::CoreHandle;

const MASTER_MAILBOX: usize = 64;

pub(crate) enum MasterCmd {
    /// Apply a store command; `resp` is present on the local frontend path.
    Apply {
        cmd: StoreCommand,
        resp: Option<oneshot::Sender<Result<Option<Data>, FabricError>>>,
    },
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

/// Handle to one master actor.
#[derive(Clone)]
pub struct MasterHandle {
    pub(crate) tx: mpsc::Sender<MasterCmd>,
}

impl std::fmt::Debug for MasterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterHandle").finish()
    }
}

pub(crate) fn spawn_master(
    name: String,
    backend: Box<dyn Backend>,
    core: CoreHandle,
    lane_rx: mpsc::Receiver<(Topic, Payload)>,
) -> MasterHandle {
    let (tx, cmd_rx) = mpsc::channel(MASTER_MAILBOX);
    let actor = MasterActor {
        clone_topic: weft_model::store_clone_topic(&name),
        name,
        backend,
        core,
        self_tx: tx.clone(),
    };
    tokio::spawn(actor.run(cmd_rx, lane_rx));
    MasterHandle { tx }
}

struct MasterActor {
    name: String,
    backend: Box<dyn Backend>,
    core: CoreHandle,
    clone_topic: Topic,
    self_tx: mpsc::Sender<MasterCmd>,
}

fn backend_failure(e: BackendError) -> FabricError {
    FabricError::BackendFailure(e.to_string())
}

impl MasterActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<MasterCmd>,
        mut lane_rx: mpsc::Receiver<(Topic, Payload)>,
    ) {
        // Re-arm timers for expiries that survived a previous run.
        match self.backend.expiries() {
            Ok(pending) => {
                for (key, expiry) in pending {
                    self.schedule_expiry(key, expiry);
                }
            }
            Err(e) => tracing::warn!(store = %self.name, error = %e, "cannot reload expiries"),
        }

        loop {
            tokio::select! {
                Some(cmd) = cmd_rx.recv() => self.handle_cmd(cmd).await,
                Some((_, payload)) = lane_rx.recv() => {
                    match payload {
                        Payload::Command(cmd) => self.apply(cmd, None).await,
                        Payload::User(_) => {
                            tracing::debug!(store = %self.name, "user data on master topic, ignoring");
                        }
                    }
                }
                else => break,
            }
        }
    }

    async fn handle_cmd(&mut self, cmd: MasterCmd) {
        match cmd {
            MasterCmd::Apply { cmd, resp } => self.apply(cmd, resp).await,
            MasterCmd::Get { key, resp } => {
                let _ = resp.send(self.backend.lookup(&key).map_err(backend_failure));
            }
            MasterCmd::Exists { key, resp } => {
                let _ = resp.send(self.backend.exists(&key).map_err(backend_failure));
            }
            MasterCmd::Keys { resp } => {
                let _ = resp.send(self.backend.keys().map_err(backend_failure));
            }
            MasterCmd::Size { resp } => {
                let _ = resp.send(self.backend.size().map_err(backend_failure));
            }
            MasterCmd::Sequence { resp } => {
                let _ = resp.send(self.backend.sequence());
            }
        }
    }

    async fn apply(
        &mut self,
        cmd: StoreCommand,
        resp: Option<oneshot::Sender<Result<Option<Data>, FabricError>>>,
    ) {
        let result = self.apply_inner(cmd).await;
        match resp {
            Some(resp) => {
                let _ = resp.send(result);
            }
            None => {
                if let Err(e) = result {
                    tracing::debug!(store = %self.name, error = %e, "published command failed");
                }
            }
        }
    }

    async fn apply_inner(&mut self, cmd: StoreCommand) -> Result<Option<Data>, FabricError> {
        match cmd {
            StoreCommand::Put { key, value, expiry } => {
                let expiry = expiry.map(|span| ExpirationTime::new(Timestamp::now(), Some(span)));
                self.backend
                    .insert(key.clone(), value.clone(), expiry)
                    .map_err(backend_failure)?;
                self.committed(UpdateOp::Put {
                    key: key.clone(),
                    value,
                    expiry,
                })
                .await;
                if let Some(expiry) = expiry {
                    self.schedule_expiry(key, expiry);
                }
                Ok(None)
            }
            StoreCommand::Erase { key } => {
                self.backend.erase(&key).map_err(backend_failure)?;
                self.committed(UpdateOp::Erase { key }).await;
                Ok(None)
            }
            StoreCommand::Clear => {
                self.backend.clear().map_err(backend_failure)?;
                self.committed(UpdateOp::Clear).await;
                Ok(None)
            }
            StoreCommand::Expire { key, expiry } => {
                let erased = self
                    .backend
                    .expire(&key, &expiry)
                    .map_err(backend_failure)?;
                if erased {
                    tracing::debug!(store = %self.name, key = ?key, "entry expired");
                    self.committed(UpdateOp::Erase { key }).await;
                }
                Ok(None)
            }
            StoreCommand::Increment { key, by, mod_time } => {
                let outcome = self.backend.increment(&key, by, mod_time);
                self.finish_mutation(key, outcome).await
            }
            StoreCommand::AddToSet {
                key,
                element,
                mod_time,
            } => {
                let outcome = self.backend.add_to_set(&key, element, mod_time);
                self.finish_mutation(key, outcome).await
            }
            StoreCommand::RemoveFromSet {
                key,
                element,
                mod_time,
            } => {
                let outcome = self.backend.remove_from_set(&key, &element, mod_time);
                self.finish_mutation(key, outcome).await
            }
            StoreCommand::PushLeft {
                key,
                items,
                mod_time,
            } => {
                let outcome = self.backend.push_left(&key, items, mod_time);
                self.finish_mutation(key, outcome).await
            }
            StoreCommand::PushRight {
                key,
                items,
                mod_time,
            } => {
                let outcome = self.backend.push_right(&key, items, mod_time);
                self.finish_mutation(key, outcome).await
            }
            StoreCommand::PopLeft { key, mod_time } => {
                let outcome = self.backend.pop_left(&key, mod_time);
                self.finish_pop(key, outcome).await
            }
            StoreCommand::PopRight { key, mod_time } => {
                let outcome = self.backend.pop_right(&key, mod_time);
                self.finish_pop(key, outcome).await
            }
            StoreCommand::Snapshot { requester } => {
                if requester.is_nil() {
                    tracing::warn!(store = %self.name, "snapshot request without requester");
                    return Err(FabricError::NoDownstreamStages);
                }
                let snapshot = self.backend.snap().map_err(backend_failure)?;
                tracing::debug!(
                    store = %self.name,
                    seq = snapshot.seq,
                    entries = snapshot.entries.len(),
                    "shipping snapshot"
                );
                let reply = Payload::Command(StoreCommand::SnapshotReply {
                    target: requester,
                    snapshot,
                });
                self.core
                    .publish_payload(self.clone_topic.clone(), reply)
                    .await?;
                Ok(None)
            }
            StoreCommand::SnapshotReply { .. } | StoreCommand::Update { .. } => {
                tracing::debug!(store = %self.name, "replication frame on master topic, ignoring");
                Ok(None)
            }
        }
    }

    async fn finish_mutation(
        &mut self,
        key: Data,
        outcome: Result<Modified, BackendError>,
    ) -> Result<Option<Data>, FabricError> {
        match outcome {
            Ok(Modified::Applied { expiry }) => {
                self.replicate_value(key, expiry).await;
                Ok(None)
            }
            Ok(Modified::TypeClash) => Err(FabricError::TypeClash),
            Err(e) => Err(backend_failure(e)),
        }
    }

    async fn finish_pop(
        &mut self,
        key: Data,
        outcome: Result<(Modified, Option<Data>), BackendError>,
    ) -> Result<Option<Data>, FabricError> {
        match outcome {
            Ok((Modified::Applied { expiry }, Some(item))) => {
                self.replicate_value(key, expiry).await;
                Ok(Some(item))
            }
            // Absent key or empty vector: success, nothing written.
            Ok((Modified::Applied { .. }, None)) => Ok(None),
            Ok((Modified::TypeClash, _)) => Err(FabricError::TypeClash),
            Err(e) => Err(backend_failure(e)),
        }
    }

    /// Read back the mutated value and replicate it as a materialized put.
    async fn replicate_value(&mut self, key: Data, expiry: Option<ExpirationTime>) {
        match self.backend.lookup(&key) {
            Ok(Some(value)) => {
                self.committed(UpdateOp::Put {
                    key: key.clone(),
                    value,
                    expiry,
                })
                .await;
                if let Some(expiry) = expiry {
                    self.schedule_expiry(key, expiry);
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(store = %self.name, error = %e, "cannot read back mutated value");
            }
        }
    }

    /// Bump the sequence and emit the replication step for this mutation.
    async fn committed(&mut self, op: UpdateOp) {
        self.backend.increase_sequence();
        let seq = self.backend.sequence();
        let update = Payload::Command(StoreCommand::Update { seq, op });
        if let Err(e) = self
            .core
            .publish_payload(self.clone_topic.clone(), update)
            .await
        {
            tracing::warn!(store = %self.name, error = %e, "cannot publish update");
        }
    }

    fn schedule_expiry(&self, key: Data, expiry: ExpirationTime) {
        let Some(deadline) = expiry.deadline() else {
            return;
        };
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline.until()).await;
            let _ = tx
                .send(MasterCmd::Apply {
                    cmd: StoreCommand::Expire { key, expiry },
                    resp: None,
                })
                .await;
        });
    }
}
