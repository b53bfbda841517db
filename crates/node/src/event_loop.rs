//! Per-tick event selection.
//!
//! The event loop is a synchronous state machine: one call to
//! [`EventLoop::step`] processes exactly one event and returns the record
//! together with the messages the runner must transmit. It performs no I/O,
//! so the TCP runtime and the deterministic simulation drive it identically.

use crate::ranges::{DrawnAction, EventRanges};
use lamport_core::{Dequeued, DrawSource, MessageQueue};
use lamport_types::{EventKind, EventRecord, LogicalClock, MachineId, Message};
use std::sync::Arc;
use tracing::{debug, trace};

/// A message the runner must transmit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: MachineId,
    pub message: Message,
}

/// Result of one tick.
#[derive(Debug, Clone)]
pub struct Tick {
    /// Record of the processed event. The runner fills `undelivered` after
    /// attempting the sends, then hands the record to the sink.
    pub record: EventRecord,
    /// Messages to send, all carrying the same clock value.
    pub outbound: Vec<Outbound>,
}

/// One machine's event loop.
pub struct EventLoop {
    id: MachineId,
    /// Peer ids in ascending order.
    peers: Vec<MachineId>,
    clock: LogicalClock,
    queue: Arc<MessageQueue>,
    ranges: EventRanges,
    draws: Box<dyn DrawSource>,
    ticks: u64,
}

impl EventLoop {
    /// Create an event loop for `id`.
    ///
    /// `peers` may be given in any order; send targets are chosen by id order.
    pub fn new(
        id: MachineId,
        peers: impl IntoIterator<Item = MachineId>,
        queue: Arc<MessageQueue>,
        ranges: EventRanges,
        draws: Box<dyn DrawSource>,
    ) -> Self {
        let mut peers: Vec<MachineId> = peers.into_iter().filter(|p| *p != id).collect();
        peers.sort_unstable();
        peers.dedup();
        Self {
            id,
            peers,
            clock: LogicalClock::new(),
            queue,
            ranges,
            draws,
            ticks: 0,
        }
    }

    /// This machine's id.
    pub fn id(&self) -> MachineId {
        self.id
    }

    /// Current logical clock value.
    pub fn clock(&self) -> u64 {
        self.clock.value()
    }

    /// Number of ticks processed.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// The inbound queue this loop drains.
    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    /// Process one event.
    ///
    /// A pending message always takes priority over a draw.
    pub fn step(&mut self) -> Tick {
        self.ticks += 1;

        if let Some(Dequeued { message, remaining }) = self.queue.try_dequeue() {
            return self.receive(message, remaining);
        }

        let (low, high) = self.ranges.draw_bounds();
        let value = self.draws.draw(low, high);
        trace!(machine = self.id.get(), value, "Drew event value");

        let action = self.ranges.classify(value);
        let targets: Vec<MachineId> = match action {
            DrawnAction::SendOne => self.peers.first().copied().into_iter().collect(),
            DrawnAction::SendOther => self.peers.get(1).copied().into_iter().collect(),
            DrawnAction::SendBoth => self.peers.clone(),
            DrawnAction::Internal => Vec::new(),
        };

        let clock = self.clock.tick();
        let kind = match (action, targets.as_slice()) {
            (_, []) => EventKind::Internal,
            (DrawnAction::SendOne, [to]) => EventKind::SendOne { to: *to },
            (DrawnAction::SendOther, [to]) => EventKind::SendOther { to: *to },
            _ => EventKind::SendBoth {
                to: targets.clone(),
            },
        };

        let outbound = targets
            .into_iter()
            .map(|to| Outbound {
                to,
                message: Message::new(self.id, clock),
            })
            .collect();

        debug!(machine = self.id.get(), kind = kind.label(), clock, "Processed event");

        Tick {
            record: EventRecord::now(self.id, kind, clock),
            outbound,
        }
    }

    fn receive(&mut self, message: Message, remaining: usize) -> Tick {
        let local_clock = self.clock.value();
        let clock = self.clock.observe(message.clock);

        debug!(
            machine = self.id.get(),
            from = message.sender.get(),
            sender_clock = message.clock,
            local_clock,
            clock,
            queue_len = remaining,
            "Received message"
        );

        Tick {
            record: EventRecord::now(
                self.id,
                EventKind::Receive {
                    from: message.sender,
                    sender_clock: message.clock,
                    local_clock,
                    queue_len_after: remaining,
                },
                clock,
            ),
            outbound: Vec::new(),
        }
    }
}
