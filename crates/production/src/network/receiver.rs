//! Per-connection receive loop.

use super::codec::decode_message;
use super::{FrameReader, LinkTable};
use futures::StreamExt;
use lamport_core::MessageQueue;
use lamport_types::MachineId;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Why a receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverExit {
    /// Network shutdown or the link was closed locally.
    Stopped,
    /// The peer closed its end.
    PeerClosed,
    /// A frame could not be read or decoded; the connection was dropped.
    Broken,
}

/// Deframe and decode messages from one peer into the queue until stopped.
///
/// A read or decode failure closes only this connection and removes it from
/// the link table; the rest of the machine is unaffected.
pub(crate) async fn receive_loop(
    local: MachineId,
    peer: MachineId,
    mut reader: FrameReader,
    queue: Arc<MessageQueue>,
    links: LinkTable,
    closed: CancellationToken,
) -> ReceiverExit {
    let exit = loop {
        let frame = tokio::select! {
            biased;
            _ = closed.cancelled() => break ReceiverExit::Stopped,
            frame = reader.next() => frame,
        };

        let bytes = match frame {
            None => {
                info!(machine = local.get(), peer = peer.get(), "Peer closed connection");
                break ReceiverExit::PeerClosed;
            }
            Some(Err(e)) => {
                warn!(machine = local.get(), peer = peer.get(), error = %e, "Failed to read frame");
                break ReceiverExit::Broken;
            }
            Some(Ok(bytes)) => bytes,
        };

        let message = match decode_message(&bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    machine = local.get(),
                    peer = peer.get(),
                    error = %e,
                    "Dropping connection after undecodable frame"
                );
                break ReceiverExit::Broken;
            }
        };

        trace!(machine = local.get(), peer = peer.get(), clock = message.clock, "Frame received");
        match queue.enqueue(message) {
            Ok(len) => trace!(machine = local.get(), queue_len = len, "Enqueued message"),
            Err(e) => warn!(
                machine = local.get(),
                peer = peer.get(),
                error = %e,
                "Dropping message"
            ),
        }
    };

    if exit != ReceiverExit::Stopped {
        if let Some(link) = links.write().remove(&peer) {
            link.closed.cancel();
        }
    }
    debug!(machine = local.get(), peer = peer.get(), ?exit, "Receiver stopped");
    exit
}
