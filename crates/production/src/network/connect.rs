//! Mesh establishment: dial with retry, accept with handshake.

use super::codec::{decode_hello, encode_frame, frame_codec, WireFrame};
use super::{FrameReader, FrameWriter};
use crate::config::RetryPolicy;
use crate::error::ConnectionError;
use futures::stream::FuturesUnordered;
use futures::{SinkExt, StreamExt};
use lamport_types::{MachineId, PeerTable};
use std::collections::BTreeSet;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

/// An established, identified link to one peer.
pub(crate) struct Connection {
    pub peer: MachineId,
    pub reader: FrameReader,
    pub writer: FrameWriter,
}

fn split(stream: TcpStream) -> (FrameReader, FrameWriter) {
    let _ = stream.set_nodelay(true);
    let (read, write) = stream.into_split();
    (
        FramedRead::new(read, frame_codec()),
        FramedWrite::new(write, frame_codec()),
    )
}

/// Dial `peer`, retrying per `retry`, then send our hello.
pub(crate) async fn dial(
    local: MachineId,
    peer: MachineId,
    addr: SocketAddr,
    retry: &RetryPolicy,
    connect_timeout: Duration,
) -> Result<Connection, ConnectionError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match try_dial(local, addr, connect_timeout).await {
            Ok((reader, writer)) => {
                info!(
                    machine = local.get(),
                    peer = peer.get(),
                    %addr,
                    attempt,
                    "Connected to peer"
                );
                return Ok(Connection {
                    peer,
                    reader,
                    writer,
                });
            }
            Err(source) if attempt >= retry.max_attempts => {
                error!(
                    machine = local.get(),
                    peer = peer.get(),
                    %addr,
                    attempts = attempt,
                    error = %source,
                    "Giving up on peer"
                );
                return Err(ConnectionError::Exhausted {
                    peer,
                    addr,
                    attempts: attempt,
                    source,
                });
            }
            Err(e) => {
                let delay = retry.delay_after(attempt);
                warn!(
                    machine = local.get(),
                    peer = peer.get(),
                    %addr,
                    attempt,
                    max_attempts = retry.max_attempts,
                    retry_in = ?delay,
                    error = %e,
                    "Connection attempt failed"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn try_dial(
    local: MachineId,
    addr: SocketAddr,
    connect_timeout: Duration,
) -> io::Result<(FrameReader, FrameWriter)> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    let (reader, mut writer) = split(stream);

    let hello = encode_frame(&WireFrame::Hello { machine: local })
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.send(hello).await?;
    Ok((reader, writer))
}

/// Accept connections until every lower-id peer has dialed in.
///
/// Handshakes run concurrently, so a silent connection only holds up itself.
/// Stray or duplicate connections are rejected and logged; they do not abort
/// startup. Fails only when `accept_timeout` elapses first.
pub(crate) async fn accept_all(
    listener: &TcpListener,
    peers: &PeerTable,
    hello_timeout: Duration,
    accept_timeout: Duration,
) -> Result<Vec<Connection>, ConnectionError> {
    let local = peers.local();
    let mut missing: BTreeSet<MachineId> = peers.inbound().collect();
    let mut accepted = Vec::with_capacity(missing.len());

    let accepting = async {
        let mut handshakes = FuturesUnordered::new();
        while !missing.is_empty() {
            tokio::select! {
                incoming = listener.accept() => match incoming {
                    Ok((stream, addr)) => handshakes.push(async move {
                        (addr, handshake(stream, addr, hello_timeout).await)
                    }),
                    Err(e) => warn!(machine = local.get(), error = %e, "Accept failed"),
                },
                Some((addr, result)) = handshakes.next(), if !handshakes.is_empty() => {
                    let result = result.and_then(|connection| {
                        if missing.remove(&connection.peer) {
                            Ok(connection)
                        } else {
                            Err(ConnectionError::Handshake {
                                addr,
                                reason: format!(
                                    "{} is not an expected inbound peer",
                                    connection.peer
                                ),
                            })
                        }
                    });
                    match result {
                        Ok(connection) => {
                            info!(
                                machine = local.get(),
                                peer = connection.peer.get(),
                                %addr,
                                "Accepted connection from peer"
                            );
                            accepted.push(connection);
                        }
                        Err(e) => {
                            warn!(machine = local.get(), %addr, error = %e, "Rejected inbound connection");
                        }
                    }
                }
            }
        }
    };

    let timed_out = tokio::time::timeout(accept_timeout, accepting)
        .await
        .is_err();
    if timed_out {
        return Err(ConnectionError::AcceptTimeout {
            missing: missing.into_iter().collect(),
        });
    }
    debug!(machine = local.get(), count = accepted.len(), "All inbound peers connected");
    Ok(accepted)
}

/// Read the hello frame that identifies the dialing peer.
async fn handshake(
    stream: TcpStream,
    addr: SocketAddr,
    hello_timeout: Duration,
) -> Result<Connection, ConnectionError> {
    let fail = |reason: String| ConnectionError::Handshake { addr, reason };

    let (mut reader, writer) = split(stream);
    let frame = match tokio::time::timeout(hello_timeout, reader.next()).await {
        Err(_) => return Err(fail("no hello before timeout".into())),
        Ok(None) => return Err(fail("closed before hello".into())),
        Ok(Some(Err(e))) => return Err(fail(e.to_string())),
        Ok(Some(Ok(frame))) => frame,
    };
    let peer = decode_hello(&frame).map_err(|e| fail(e.to_string()))?;
    Ok(Connection {
        peer,
        reader,
        writer,
    })
}
