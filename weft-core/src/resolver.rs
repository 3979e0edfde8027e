//! Resolver - locates a remote master across known peers
//!
//! A short-lived task. The core fans a `MasterQuery` out to every ready
//! peer and funnels the replies here; the first affirmative wins. All-
//! negative replies yield `NoSuchMaster`; silence past the deadline yields
//! `Timeout`.

use crate::core_actor::{CoreCmd, CoreHandle};
use crate::frontend::StoreFrontend;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use weft_model::{EndpointId, FabricError};

pub(crate) fn spawn_resolver(
    core: CoreHandle,
    name: String,
    requests: Vec<u64>,
    mut results: mpsc::UnboundedReceiver<(EndpointId, bool)>,
    expected: usize,
    timeout: Duration,
    resp: oneshot::Sender<Result<StoreFrontend, FabricError>>,
) {
    tokio::spawn(async move {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut negatives = 0;
        let result = loop {
            tokio::select! {
                _ = &mut deadline => {
                    tracing::debug!(store = %name, "master resolution timed out");
                    break Err(FabricError::Timeout);
                }
                reply = results.recv() => match reply {
                    Some((peer, true)) => {
                        tracing::debug!(store = %name, master = %peer, "resolved remote master");
                        break Ok(peer);
                    }
                    Some((_, false)) => {
                        negatives += 1;
                        if negatives >= expected {
                            tracing::debug!(store = %name, "all peers answered negatively");
                            break Err(FabricError::NoSuchMaster);
                        }
                    }
                    None => break Err(FabricError::NoSuchMaster),
                }
            }
        };

        let _ = core
            .tx
            .send(CoreCmd::CloneResolved {
                name,
                requests,
                result,
                resp,
            })
            .await;
    });
}
