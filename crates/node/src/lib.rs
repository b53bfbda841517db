//! Per-machine event loop.
//!
//! Each tick either drains one queued message (receive, clock observes the
//! sender's timestamp) or draws an idle action (internal or send, clock
//! ticks once). All I/O is left to the runner via the returned [`Tick`].

mod event_loop;
mod ranges;

pub use event_loop::{EventLoop, Outbound, Tick};
pub use ranges::{DrawnAction, EventRangeError, EventRanges};
