//! Ordering of scheduled simulation events.

use lamport_types::{MachineId, Message};
use std::cmp::Ordering;
use std::time::Duration;

/// Processing order for events scheduled at the same instant.
///
/// Deliveries go first so a message arriving exactly at a tick boundary is
/// visible to that tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventPriority {
    Delivery = 0,
    Tick = 1,
}

/// Something that happens to one machine at one simulated instant.
#[derive(Debug, Clone)]
pub enum SimEvent {
    /// The machine's clock fires.
    Tick,
    /// A message lands in the machine's queue.
    Deliver(Message),
}

impl SimEvent {
    pub fn priority(&self) -> EventPriority {
        match self {
            SimEvent::Deliver(_) => EventPriority::Delivery,
            SimEvent::Tick => EventPriority::Tick,
        }
    }
}

/// Key for the event queue, ordered by time, then priority, then machine,
/// then scheduling order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventKey {
    /// When this event should be processed.
    pub time: Duration,
    pub priority: EventPriority,
    /// Which machine the event is for.
    pub machine: MachineId,
    /// Sequence number for FIFO ordering among otherwise equal keys.
    pub sequence: u64,
}

impl EventKey {
    pub fn new(time: Duration, event: &SimEvent, machine: MachineId, sequence: u64) -> Self {
        Self {
            time,
            priority: event.priority(),
            machine,
            sequence,
        }
    }
}

impl Ord for EventKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then(self.priority.cmp(&other.priority))
            .then(self.machine.cmp(&other.machine))
            .then(self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for EventKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
