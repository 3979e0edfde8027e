//! Reconnect supervisor - keeps a remote peering alive
//!
//! One task per remote peering. Connects, hands the socket to the core
//! (which runs handshake step #0 over it), then waits for the connection
//! to die. Every loss lands on the outgoing status queue; with a zero
//! retry interval a single attempt is made and the failure reported.

use crate::core_actor::{CoreCmd, CoreHandle};
use crate::status::{emit, StatusKind, StatusSender};
use std::time::Duration;
use tokio::sync::mpsc;
use weft_model::{EndpointId, EndpointInfo, NetworkInfo};

pub(crate) fn spawn_supervisor(
    core: CoreHandle,
    network: NetworkInfo,
    retry: Duration,
    status: StatusSender,
) {
    tokio::spawn(async move {
        // The remote's id is unknown until the handshake completes, so
        // status events carry the network info with a nil id.
        let peer = EndpointInfo::with_network(EndpointId::nil(), network.clone());
        emit(&status, peer.clone(), StatusKind::Initializing, "connecting");

        // The core fires this on explicit unpeer.
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

        loop {
            match weft_net::connect(&network.host, network.port, core.conn_ingest()).await {
                Ok((conn, mut closed)) => {
                    tracing::debug!(peer = %network, "connected");
                    let opened = CoreCmd::ConnOpened {
                        conn,
                        network: Some(network.clone()),
                        stop: Some(stop_tx.clone()),
                    };
                    if core.tx.send(opened).await.is_err() {
                        return;
                    }
                    // Park until the connection dies or the peering is
                    // torn down.
                    tokio::select! {
                        _ = &mut closed => {
                            tracing::debug!(peer = %network, "lost connection");
                            emit(
                                &status,
                                peer.clone(),
                                StatusKind::Disconnected,
                                "connection lost",
                            );
                        }
                        _ = stop_rx.recv() => {
                            tracing::debug!(peer = %network, "unpeered, supervisor stopping");
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(peer = %network, error = %e, "connect attempt failed");
                    emit(
                        &status,
                        peer.clone(),
                        StatusKind::Disconnected,
                        format!("connect failed: {e}"),
                    );
                }
            }
            if retry.is_zero() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(retry) => {}
                _ = stop_rx.recv() => return,
            }
        }
    });
}
