//! StoreFrontend - per-store handle handed out by attach operations
//!
//! Reads go to the local master or clone replica. Writes apply directly on
//! a local master (with the result reported back); from a clone they are
//! published to the master topic and applied wherever the master lives,
//! with eventual consistency.

use crate::clone_actor::{CloneCmd, CloneHandle};
use crate::core_actor::CoreHandle;
use crate::master::{MasterCmd, MasterHandle};
use tokio::sync::oneshot;
use weft_model::{
    store_master_topic, Data, EndpointId, FabricError, Payload, SequenceNum, Span, StoreCommand,
    Timestamp,
};

/// Where a store's master lives.
#[derive(Debug, Clone)]
pub enum MasterRef {
    Local(MasterHandle),
    Remote(EndpointId),
}

#[derive(Clone)]
enum FrontendKind {
    Master(MasterHandle),
    Clone(CloneHandle),
}

/// Handle to one attached store.
#[derive(Clone)]
pub struct StoreFrontend {
    name: String,
    core: CoreHandle,
    kind: FrontendKind,
}

impl std::fmt::Debug for StoreFrontend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreFrontend")
            .field("name", &self.name)
            .field("is_master", &self.is_master())
            .finish()
    }
}

impl StoreFrontend {
    pub(crate) fn for_master(name: String, handle: MasterHandle, core: CoreHandle) -> Self {
        StoreFrontend {
            name,
            core,
            kind: FrontendKind::Master(handle),
        }
    }

    pub(crate) fn for_clone(name: String, handle: CloneHandle, core: CoreHandle) -> Self {
        StoreFrontend {
            name,
            core,
            kind: FrontendKind::Clone(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_master(&self) -> bool {
        matches!(self.kind, FrontendKind::Master(_))
    }

    // ---- writes -------------------------------------------------------------

    pub async fn put(
        &self,
        key: Data,
        value: Data,
        expiry: Option<Span>,
    ) -> Result<(), FabricError> {
        self.command(StoreCommand::Put { key, value, expiry })
            .await
            .map(|_| ())
    }

    pub async fn erase(&self, key: Data) -> Result<(), FabricError> {
        self.command(StoreCommand::Erase { key }).await.map(|_| ())
    }

    pub async fn clear(&self) -> Result<(), FabricError> {
        self.command(StoreCommand::Clear).await.map(|_| ())
    }

    pub async fn increment(&self, key: Data, by: i64) -> Result<(), FabricError> {
        self.command(StoreCommand::Increment {
            key,
            by,
            mod_time: Timestamp::now(),
        })
        .await
        .map(|_| ())
    }

    pub async fn add_to_set(&self, key: Data, element: Data) -> Result<(), FabricError> {
        self.command(StoreCommand::AddToSet {
            key,
            element,
            mod_time: Timestamp::now(),
        })
        .await
        .map(|_| ())
    }

    pub async fn remove_from_set(&self, key: Data, element: Data) -> Result<(), FabricError> {
        self.command(StoreCommand::RemoveFromSet {
            key,
            element,
            mod_time: Timestamp::now(),
        })
        .await
        .map(|_| ())
    }

    pub async fn push_left(&self, key: Data, items: Vec<Data>) -> Result<(), FabricError> {
        self.command(StoreCommand::PushLeft {
            key,
            items,
            mod_time: Timestamp::now(),
        })
        .await
        .map(|_| ())
    }

    pub async fn push_right(&self, key: Data, items: Vec<Data>) -> Result<(), FabricError> {
        self.command(StoreCommand::PushRight {
            key,
            items,
            mod_time: Timestamp::now(),
        })
        .await
        .map(|_| ())
    }

    /// Pop from the front of a vector value. On a clone this is
    /// fire-and-forget: the popped value is not observable remotely.
    pub async fn pop_left(&self, key: Data) -> Result<Option<Data>, FabricError> {
        self.command(StoreCommand::PopLeft {
            key,
            mod_time: Timestamp::now(),
        })
        .await
    }

    pub async fn pop_right(&self, key: Data) -> Result<Option<Data>, FabricError> {
        self.command(StoreCommand::PopRight {
            key,
            mod_time: Timestamp::now(),
        })
        .await
    }

    async fn command(&self, cmd: StoreCommand) -> Result<Option<Data>, FabricError> {
        match &self.kind {
            FrontendKind::Master(master) => {
                let (tx, rx) = oneshot::channel();
                master
                    .tx
                    .send(MasterCmd::Apply {
                        cmd,
                        resp: Some(tx),
                    })
                    .await
                    .map_err(|_| FabricError::ChannelClosed)?;
                rx.await.map_err(|_| FabricError::ChannelClosed)?
            }
            FrontendKind::Clone(_) => {
                let topic = store_master_topic(&self.name);
                self.core
                    .publish_payload(topic, Payload::Command(cmd))
                    .await?;
                Ok(None)
            }
        }
    }

    // ---- reads --------------------------------------------------------------

    pub async fn get(&self, key: Data) -> Result<Option<Data>, FabricError> {
        match &self.kind {
            FrontendKind::Master(master) => {
                request(&master.tx, |resp| MasterCmd::Get { key, resp }).await?
            }
            FrontendKind::Clone(clone) => {
                request(&clone.tx, |resp| CloneCmd::Get { key, resp }).await?
            }
        }
    }

    pub async fn exists(&self, key: Data) -> Result<bool, FabricError> {
        match &self.kind {
            FrontendKind::Master(master) => {
                request(&master.tx, |resp| MasterCmd::Exists { key, resp }).await?
            }
            FrontendKind::Clone(clone) => {
                request(&clone.tx, |resp| CloneCmd::Exists { key, resp }).await?
            }
        }
    }

    pub async fn keys(&self) -> Result<Vec<Data>, FabricError> {
        match &self.kind {
            FrontendKind::Master(master) => {
                request(&master.tx, |resp| MasterCmd::Keys { resp }).await?
            }
            FrontendKind::Clone(clone) => {
                request(&clone.tx, |resp| CloneCmd::Keys { resp }).await?
            }
        }
    }

    pub async fn size(&self) -> Result<u64, FabricError> {
        match &self.kind {
            FrontendKind::Master(master) => {
                request(&master.tx, |resp| MasterCmd::Size { resp }).await?
            }
            FrontendKind::Clone(clone) => {
                request(&clone.tx, |resp| CloneCmd::Size { resp }).await?
            }
        }
    }

    /// The sequence number of the local state (authoritative for masters,
    /// replica position for clones).
    pub async fn sequence(&self) -> Result<SequenceNum, FabricError> {
        match &self.kind {
            FrontendKind::Master(master) => {
                request(&master.tx, |resp| MasterCmd::Sequence { resp }).await
            }
            FrontendKind::Clone(clone) => {
                request(&clone.tx, |resp| CloneCmd::Sequence { resp }).await
            }
        }
    }
}

async fn request<C, T>(
    tx: &tokio::sync::mpsc::Sender<C>,
    build: impl FnOnce(oneshot::Sender<T>) -> C,
) -> Result<T, FabricError> {
    let (resp_tx, resp_rx) = oneshot::channel();
    tx.send(build(resp_tx))
        .await
        .map_err(|_| FabricError::ChannelClosed)?;
    resp_rx.await.map_err(|_| FabricError::ChannelClosed)
}
