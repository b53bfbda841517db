//! Error types for the machine runtime.
//!
//! Only a [`ConnectionError`] during startup is fatal to a machine. Every
//! other kind is logged where it happens and the machine keeps running.

use crate::config::ConfigError;
use crate::network::CodecError;
use lamport_types::MachineId;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Failure to establish the full mesh.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Gave up connecting to {peer} at {addr} after {attempts} attempts: {source}")]
    Exhausted {
        peer: MachineId,
        addr: SocketAddr,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("Handshake with {addr} failed: {reason}")]
    Handshake { addr: SocketAddr, reason: String },

    #[error("Timed out waiting for inbound connections from {missing:?}")]
    AcceptTimeout { missing: Vec<MachineId> },

    #[error("Startup cancelled by shutdown request")]
    Cancelled,
}

/// Failure to transmit one message on an established link.
#[derive(Debug, Error)]
pub enum TransmissionError {
    #[error("No connection to {0}")]
    NotConnected(MachineId),

    #[error("Write to {peer} failed: {source}")]
    Io {
        peer: MachineId,
        #[source]
        source: io::Error,
    },

    #[error("Write to {0} timed out")]
    Timeout(MachineId),

    #[error("Encode error: {0}")]
    Encode(#[from] CodecError),
}

/// Graceful release did not finish within the grace period.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShutdownError {
    #[error("{receivers} receivers and {writers} writers not released within the grace period")]
    Timeout { receivers: usize, writers: usize },
}

/// Top-level machine failure.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Failed to open event log: {0}")]
    EventLog(#[source] io::Error),
}
