//! Shared building blocks for machine runners.
//!
//! - [`MessageQueue`]: the per-machine inbound FIFO, safe for concurrent producers
//! - [`EventSink`]: where event records go ([`TracingSink`], [`MemorySink`],
//!   [`JsonLinesSink`], [`FanoutSink`])
//! - [`DrawSource`]: pluggable randomness for event selection

mod draw;
mod queue;
mod sink;

pub use draw::{DrawSource, ScriptedDraws, SeededDraws};
pub use queue::{Dequeued, MessageQueue, QueueConfig, QueueError};
pub use sink::{EventSink, FanoutSink, JsonLinesSink, MemorySink, SinkError, TracingSink};
