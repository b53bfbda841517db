//! Full-mesh TCP network layer.
//!
//! One listener per machine plus one connection per peer pair. The machine
//! with the lower id dials; the higher id accepts. Each connection gets a
//! dedicated receiver task that feeds the machine's [`MessageQueue`]; sends
//! come from the event loop only.

mod codec;
mod connect;
mod receiver;

pub use codec::{
    decode_frame, decode_hello, decode_message, encode_frame, frame_codec, CodecError, WireFrame,
    MAX_FRAME_LEN,
};
pub use receiver::ReceiverExit;

use crate::config::MachineConfig;
use crate::error::{ConnectionError, ShutdownError, TransmissionError};
use bytes::Bytes;
use connect::{accept_all, dial, Connection};
use futures::future::{join_all, try_join_all};
use futures::SinkExt;
use lamport_core::MessageQueue;
use lamport_types::{MachineId, Message};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub(crate) type FrameReader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
pub(crate) type FrameWriter = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

/// Sending half of one peer connection.
pub(crate) struct PeerLink {
    writer: tokio::sync::Mutex<FrameWriter>,
    /// Cancelled when the connection is dropped, from either side.
    closed: CancellationToken,
}

/// Live connections, keyed by peer.
pub(crate) type LinkTable = Arc<RwLock<HashMap<MachineId, Arc<PeerLink>>>>;

/// An established full mesh.
pub struct Network {
    local: MachineId,
    local_addr: SocketAddr,
    links: LinkTable,
    /// Peers whose last send failed.
    suspects: Mutex<BTreeSet<MachineId>>,
    receivers: Vec<JoinHandle<ReceiverExit>>,
    shutdown: CancellationToken,
    write_timeout: Duration,
}

impl Network {
    /// Bind, dial every higher-id peer and accept every lower-id peer.
    ///
    /// Returns only once every link is up. Any dial that exhausts its retries,
    /// or an accept timeout, fails the whole call; `cancel` aborts it.
    pub async fn establish(
        config: &MachineConfig,
        queue: Arc<MessageQueue>,
        cancel: &CancellationToken,
    ) -> Result<Self, ConnectionError> {
        let local = config.id;
        let peers = config.peer_table();

        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|source| ConnectionError::Bind {
                addr: config.listen_addr,
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ConnectionError::Bind {
                addr: config.listen_addr,
                source,
            })?;
        info!(machine = local.get(), addr = %local_addr, peers = peers.len(), "Listening");

        let outbound = try_join_all(peers.outbound().map(|(peer, addr)| {
            dial(local, peer, addr, &config.retry, config.connect_timeout)
        }));
        let inbound = accept_all(
            &listener,
            &peers,
            config.connect_timeout,
            config.accept_timeout,
        );

        let (dialed, accepted) = tokio::select! {
            _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
            result = async { tokio::try_join!(outbound, inbound) } => result?,
        };
        drop(listener);

        let mut network = Self {
            local,
            local_addr,
            links: Arc::new(RwLock::new(HashMap::new())),
            suspects: Mutex::new(BTreeSet::new()),
            receivers: Vec::new(),
            shutdown: CancellationToken::new(),
            write_timeout: config.write_timeout,
        };
        for connection in dialed.into_iter().chain(accepted) {
            network.attach(connection, Arc::clone(&queue));
        }
        info!(machine = local.get(), links = network.links.read().len(), "Mesh established");
        Ok(network)
    }

    fn attach(&mut self, connection: Connection, queue: Arc<MessageQueue>) {
        let Connection {
            peer,
            reader,
            writer,
        } = connection;
        let closed = self.shutdown.child_token();
        self.links.write().insert(
            peer,
            Arc::new(PeerLink {
                writer: tokio::sync::Mutex::new(writer),
                closed: closed.clone(),
            }),
        );
        self.receivers.push(tokio::spawn(receiver::receive_loop(
            self.local,
            peer,
            reader,
            queue,
            Arc::clone(&self.links),
            closed,
        )));
    }

    /// Address the listener was bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Peers with a live connection, ascending.
    pub fn connected_peers(&self) -> Vec<MachineId> {
        let mut peers: Vec<_> = self.links.read().keys().copied().collect();
        peers.sort_unstable();
        peers
    }

    /// Peers whose most recent send failed.
    pub fn suspected_peers(&self) -> Vec<MachineId> {
        self.suspects.lock().iter().copied().collect()
    }

    /// Transmit one message to `to`.
    ///
    /// A failed or timed-out write drops the connection and marks the peer
    /// suspect; the caller decides how to record the failure. Dropping the
    /// writer discards any partly flushed frame, so a message reported as
    /// failed never reaches the peer later.
    pub async fn send(&self, to: MachineId, message: &Message) -> Result<(), TransmissionError> {
        let result = self.try_send(to, message).await;
        match &result {
            Ok(()) => {
                self.suspects.lock().remove(&to);
            }
            Err(e) => {
                self.suspects.lock().insert(to);
                if matches!(e, TransmissionError::Io { .. } | TransmissionError::Timeout(_)) {
                    self.drop_link(to);
                }
            }
        }
        result
    }

    async fn try_send(&self, to: MachineId, message: &Message) -> Result<(), TransmissionError> {
        let link = self
            .links
            .read()
            .get(&to)
            .cloned()
            .ok_or(TransmissionError::NotConnected(to))?;
        let frame = encode_frame(&WireFrame::Clock(message.clone()))?;

        let mut writer = link.writer.lock().await;
        match tokio::time::timeout(self.write_timeout, writer.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(TransmissionError::Io { peer: to, source }),
            Err(_) => Err(TransmissionError::Timeout(to)),
        }
    }

    fn drop_link(&self, peer: MachineId) {
        if let Some(link) = self.links.write().remove(&peer) {
            link.closed.cancel();
            warn!(machine = self.local.get(), peer = peer.get(), "Dropped connection to peer");
        }
    }

    /// Close every connection and wait for receiver tasks to finish.
    ///
    /// Each link is half-closed first; its receiver keeps draining until the
    /// peer closes its end. Waits at most `grace` overall. Writers that could
    /// not be closed and receivers still running after that are released
    /// forcibly and reported as [`ShutdownError::Timeout`].
    pub async fn shutdown(&mut self, grace: Duration) -> Result<(), ShutdownError> {
        let deadline = Instant::now() + grace;

        let links: Vec<_> = self.links.write().drain().map(|(_, link)| link).collect();
        let mut writers = 0;
        for link in links {
            let closing = async {
                let mut writer = link.writer.lock().await;
                SinkExt::<Bytes>::close(&mut *writer).await
            };
            match tokio::time::timeout_at(deadline, closing).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(machine = self.local.get(), error = %e, "Writer closed with error");
                }
                Err(_) => {
                    warn!(machine = self.local.get(), "Writer close timed out");
                    writers += 1;
                }
            }
        }

        let receivers = join_within(deadline, std::mem::take(&mut self.receivers)).await;
        self.shutdown.cancel();
        if receivers > 0 || writers > 0 {
            warn!(
                machine = self.local.get(),
                receivers,
                writers,
                "Resources outlived grace period"
            );
            return Err(ShutdownError::Timeout { receivers, writers });
        }
        info!(machine = self.local.get(), "Network closed");
        Ok(())
    }
}

/// Wait for `handles` until `deadline`, then abort the rest.
///
/// Returns how many were still running.
async fn join_within(deadline: Instant, mut handles: Vec<JoinHandle<ReceiverExit>>) -> usize {
    let _ = tokio::time::timeout_at(deadline, join_all(handles.iter_mut())).await;
    let pending = handles.iter().filter(|h| !h.is_finished()).count();
    for handle in &handles {
        handle.abort();
    }
    pending
}

impl Drop for Network {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for handle in &self.receivers {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_within_aborts_stragglers() {
        let done = tokio::spawn(async { ReceiverExit::PeerClosed });
        let stuck = tokio::spawn(std::future::pending::<ReceiverExit>());
        tokio::task::yield_now().await;

        let deadline = Instant::now() + Duration::from_millis(50);
        let pending = join_within(deadline, vec![done, stuck]).await;
        assert_eq!(pending, 1);
    }

    #[tokio::test]
    async fn test_join_within_all_finished() {
        let handles = (0..3)
            .map(|_| tokio::spawn(async { ReceiverExit::Stopped }))
            .collect();
        let deadline = Instant::now() + Duration::from_secs(1);
        assert_eq!(join_within(deadline, handles).await, 0);
    }
}
