//! Messages exchanged between machines.

use crate::MachineId;
use serde::{Deserialize, Serialize};

/// A timestamped message from one machine to another.
///
/// Carries the sender's logical clock at send time. The payload is optional;
/// the simulation itself only ever transports the clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Machine that sent the message.
    pub sender: MachineId,
    /// Sender's logical clock after its send event.
    pub clock: u64,
    /// Optional opaque payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl Message {
    /// Create a message carrying only a clock value.
    pub fn new(sender: MachineId, clock: u64) -> Self {
        Self {
            sender,
            clock,
            payload: None,
        }
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}
