//! Frame encoding and decoding for peer connections.
//!
//! # Wire Format
//!
//! Every frame is length-delimited (4-byte big-endian length prefix, handled
//! by [`LengthDelimitedCodec`]) and carries one JSON object:
//!
//! ```text
//! [u32 length][{"type":"hello","machine":1}]
//! [u32 length][{"type":"clock","sender":1,"clock":7}]
//! ```
//!
//! The first frame on every connection is a `hello` from the dialing side so
//! the accepting side learns which peer it is talking to. Every later frame
//! is a `clock` message.

use bytes::Bytes;
use lamport_types::{MachineId, Message};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::LengthDelimitedCodec;

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Empty frame")]
    EmptyFrame,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unexpected hello after handshake")]
    UnexpectedHello,

    #[error("Expected hello, got a clock message")]
    MissingHello,
}

/// One frame on a peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireFrame {
    /// Identifies the dialing machine.
    Hello { machine: MachineId },
    /// A timestamped message.
    Clock(Message),
}

/// Build the length-delimited codec used on every connection.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Encode a frame body (the length prefix is added by the codec).
pub fn encode_frame(frame: &WireFrame) -> Result<Bytes, CodecError> {
    Ok(Bytes::from(serde_json::to_vec(frame)?))
}

/// Decode a frame body.
pub fn decode_frame(data: &[u8]) -> Result<WireFrame, CodecError> {
    if data.is_empty() {
        return Err(CodecError::EmptyFrame);
    }
    Ok(serde_json::from_slice(data)?)
}

/// Decode a frame that must be a hello.
pub fn decode_hello(data: &[u8]) -> Result<MachineId, CodecError> {
    match decode_frame(data)? {
        WireFrame::Hello { machine } => Ok(machine),
        WireFrame::Clock(_) => Err(CodecError::MissingHello),
    }
}

/// Decode a frame that must be a clock message.
pub fn decode_message(data: &[u8]) -> Result<Message, CodecError> {
    match decode_frame(data)? {
        WireFrame::Clock(message) => Ok(message),
        WireFrame::Hello { .. } => Err(CodecError::UnexpectedHello),
    }
}
