//! Deterministic simulation runner.
//!
//! Runs several machines' event loops on one simulated timeline, without
//! sockets or wall-clock time. Given the same seed it produces identical
//! records every run, which makes clock and delivery properties checkable
//! over long runs in milliseconds.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  SimulationRunner                       │
//! │                                                         │
//! │  ┌────────────────────────────────────────────────────┐ │
//! │  │     Event Queue (BTreeMap<EventKey, SimEvent>)     │ │
//! │  │     Ordered by: time, priority, machine, sequence  │ │
//! │  └────────────────────────┬───────────────────────────┘ │
//! │                           │                             │
//! │                           ▼                             │
//! │  ┌────────────────────────────────────────────────────┐ │
//! │  │     Tick → EventLoop::step                         │ │
//! │  │     Deliver → MessageQueue::enqueue                │ │
//! │  └────────────────────────┬───────────────────────────┘ │
//! │                           │                             │
//! │                           ▼                             │
//! │  ┌────────────────────────────────────────────────────┐ │
//! │  │     Outbound → Deliver after latency               │ │
//! │  │     Record → DeliveryLedger, stats, sink           │ │
//! │  └────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────┘
//! ```

mod event_queue;
mod ledger;
mod runner;

pub use event_queue::{EventKey, EventPriority, SimEvent};
pub use ledger::{DeliveryLedger, LedgerError, MessageId};
pub use runner::{NodeStats, SimulationConfig, SimulationError, SimulationRunner, SimulationStats};
