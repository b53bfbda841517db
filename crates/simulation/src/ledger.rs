//! Exactly-once delivery bookkeeping.
//!
//! A message is identified by `(sender, receiver, sender_clock)`: a machine
//! never reuses a clock value, and a send to both peers shares one clock
//! value across two different receivers.

use lamport_types::{EventKind, EventRecord, MachineId};
use std::collections::BTreeSet;
use thiserror::Error;

/// Identity of one message on one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId {
    pub from: MachineId,
    pub to: MachineId,
    pub clock: u64,
}

/// A delivery that breaks exactly-once.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("{0:?} was received twice")]
    Duplicate(MessageId),

    #[error("{0:?} was received but never sent")]
    Phantom(MessageId),

    #[error("{outstanding} messages outstanding but only {accounted} in flight, queued or dropped")]
    Lost { outstanding: usize, accounted: usize },
}

/// Tracks sent and received messages across the whole simulation.
#[derive(Debug, Default)]
pub struct DeliveryLedger {
    sent: BTreeSet<MessageId>,
    received: BTreeSet<MessageId>,
    violations: Vec<LedgerError>,
}

impl DeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&mut self, id: MessageId) {
        self.sent.insert(id);
    }

    pub fn received(&mut self, id: MessageId) {
        if !self.sent.contains(&id) {
            self.violations.push(LedgerError::Phantom(id));
        } else if !self.received.insert(id) {
            self.violations.push(LedgerError::Duplicate(id));
        }
    }

    /// Record whatever a processed event implies for the ledger.
    pub fn observe(&mut self, record: &EventRecord) {
        match &record.kind {
            EventKind::Receive {
                from, sender_clock, ..
            } => self.received(MessageId {
                from: *from,
                to: record.machine,
                clock: *sender_clock,
            }),
            kind => {
                for to in kind.targets() {
                    if !record.undelivered.contains(to) {
                        self.sent(MessageId {
                            from: record.machine,
                            to: *to,
                            clock: record.logical_clock,
                        });
                    }
                }
            }
        }
    }

    pub fn sent_count(&self) -> usize {
        self.sent.len()
    }

    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    /// Sent messages not yet received, in id order.
    pub fn outstanding(&self) -> Vec<MessageId> {
        self.sent.difference(&self.received).copied().collect()
    }

    /// Every violation seen so far.
    pub fn violations(&self) -> &[LedgerError] {
        &self.violations
    }

    /// Fail with the first violation, if any.
    pub fn verify(&self) -> Result<(), LedgerError> {
        match self.violations.first() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}
