//! Structured event records.
//!
//! One record is produced per processed event on a machine. Records are
//! append-only and are handed to an event sink in processing order.

use crate::MachineId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// What happened during one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// Local computation only.
    Internal,

    /// Sent one message to the first peer.
    SendOne { to: MachineId },

    /// Sent one message to the second peer.
    SendOther { to: MachineId },

    /// Sent the same timestamp to every peer.
    SendBoth { to: Vec<MachineId> },

    /// Consumed one queued message.
    Receive {
        from: MachineId,
        /// Clock value carried by the consumed message.
        sender_clock: u64,
        /// Local clock before the update.
        local_clock: u64,
        /// Messages still pending immediately after the dequeue.
        queue_len_after: usize,
    },
}

impl EventKind {
    /// Short upper-case label, as used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::Internal => "INTERNAL",
            EventKind::SendOne { .. } => "SEND_ONE",
            EventKind::SendOther { .. } => "SEND_OTHER",
            EventKind::SendBoth { .. } => "SEND_BOTH",
            EventKind::Receive { .. } => "RECEIVE",
        }
    }

    /// Whether this event transmitted any message.
    pub fn is_send(&self) -> bool {
        matches!(
            self,
            EventKind::SendOne { .. } | EventKind::SendOther { .. } | EventKind::SendBoth { .. }
        )
    }

    /// Destinations of a send event (empty for other kinds).
    pub fn targets(&self) -> &[MachineId] {
        match self {
            EventKind::SendOne { to } | EventKind::SendOther { to } => std::slice::from_ref(to),
            EventKind::SendBoth { to } => to,
            _ => &[],
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One processed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Machine that processed the event.
    pub machine: MachineId,
    /// Event kind and kind-specific detail.
    pub kind: EventKind,
    /// Wall clock at record time, milliseconds since the Unix epoch.
    pub system_time_ms: u64,
    /// Logical clock after the event's update.
    pub logical_clock: u64,
    /// Peers whose transmission failed for this event.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub undelivered: Vec<MachineId>,
}

impl EventRecord {
    /// Create a record stamped with the current wall clock.
    pub fn now(machine: MachineId, kind: EventKind, logical_clock: u64) -> Self {
        Self {
            machine,
            kind,
            system_time_ms: unix_millis(SystemTime::now()),
            logical_clock,
            undelivered: Vec::new(),
        }
    }

    /// Queue length after the dequeue, for receive events.
    pub fn queue_len_after(&self) -> Option<usize> {
        match self.kind {
            EventKind::Receive {
                queue_len_after, ..
            } => Some(queue_len_after),
            _ => None,
        }
    }

    /// How far a receive pushed the clock beyond a plain tick.
    ///
    /// Zero when the sender was not ahead of us.
    pub fn drift(&self) -> Option<u64> {
        match self.kind {
            EventKind::Receive { local_clock, .. } => {
                Some(self.logical_clock.saturating_sub(local_clock + 1))
            }
            _ => None,
        }
    }
}

/// Milliseconds since the Unix epoch, saturating at zero for pre-epoch clocks.
pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receive(local_clock: u64, sender_clock: u64, new_clock: u64) -> EventRecord {
        EventRecord::now(
            MachineId(2),
            EventKind::Receive {
                from: MachineId(1),
                sender_clock,
                local_clock,
                queue_len_after: 3,
            },
            new_clock,
        )
    }

    #[test]
    fn test_drift_when_sender_ahead() {
        let record = receive(2, 9, 10);
        assert_eq!(record.drift(), Some(7));
        assert_eq!(record.queue_len_after(), Some(3));
    }

    #[test]
    fn test_no_drift_when_sender_behind() {
        let record = receive(9, 2, 10);
        assert_eq!(record.drift(), Some(0));
    }

    #[test]
    fn test_non_receive_has_no_queue_len() {
        let record = EventRecord::now(MachineId(1), EventKind::Internal, 4);
        assert_eq!(record.queue_len_after(), None);
        assert_eq!(record.drift(), None);
    }

    #[test]
    fn test_targets() {
        let both = EventKind::SendBoth {
            to: vec![MachineId(2), MachineId(3)],
        };
        assert_eq!(both.targets(), &[MachineId(2), MachineId(3)]);
        assert_eq!(EventKind::SendOne { to: MachineId(2) }.targets(), &[MachineId(2)]);
        assert!(EventKind::Internal.targets().is_empty());
        assert!(both.is_send());
        assert!(!EventKind::Internal.is_send());
    }

    #[test]
    fn test_json_shape() {
        let record = EventRecord {
            machine: MachineId(1),
            kind: EventKind::SendOne { to: MachineId(2) },
            system_time_ms: 1000,
            logical_clock: 1,
            undelivered: vec![],
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"]["type"], "SEND_ONE");
        assert_eq!(json["kind"]["to"], 2);
        assert_eq!(json["logical_clock"], 1);
        assert!(json.get("undelivered").is_none());
    }
}
