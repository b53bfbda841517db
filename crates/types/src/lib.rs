//! Core types for the Lamport clock machine network.
//!
//! Leaf crate: identifiers, the logical clock, messages, event records and
//! the static peer table. No I/O and no concurrency lives here.

mod clock;
mod identifiers;
mod message;
mod record;
mod topology;

pub use clock::LogicalClock;
pub use identifiers::MachineId;
pub use message::Message;
pub use record::{unix_millis, EventKind, EventRecord};
pub use topology::PeerTable;
