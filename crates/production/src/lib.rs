//! TCP runtime for Lamport-clock machines.
//!
//! Each [`Machine`] binds a listener, joins a full mesh with its peers, and
//! then processes one event per tick at its own clock rate: it either drains
//! a received message or draws a send/internal event. Every processed event is
//! handed to an [`EventSink`](lamport_core::EventSink).
//!
//! ```text
//!  receiver tasks ──► MessageQueue ──► EventLoop::step ──► Network::send
//!                                           │
//!                                           └──► EventSink
//! ```

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod machine;
pub mod network;

pub use config::{Backoff, ClockRateRange, ConfigError, MachineConfig, RetryPolicy};
pub use error::{ConnectionError, MachineError, ShutdownError, TransmissionError};
pub use lifecycle::MachineState;
pub use machine::{sink_for, Machine, MachineHandle, MachineReport};
pub use network::{CodecError, Network, WireFrame};
