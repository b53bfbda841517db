//! Machine lifecycle states.

use lamport_types::MachineId;
use std::fmt;
use tokio::sync::watch;
use tracing::{debug, info};

/// Where a machine is in its life.
///
/// States only move forward:
/// `Initializing → Connecting → Running → ShuttingDown → Terminated`.
/// A failed or cancelled startup jumps from `Connecting` straight to
/// `Terminated`, and a shutdown requested while connecting goes through
/// `ShuttingDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MachineState {
    Initializing,
    Connecting,
    Running,
    ShuttingDown,
    Terminated,
}

impl MachineState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: MachineState) -> bool {
        use MachineState::*;
        matches!(
            (self, next),
            (Initializing, Connecting)
                | (Initializing, Terminated)
                | (Connecting, Running)
                | (Connecting, ShuttingDown)
                | (Connecting, Terminated)
                | (Running, ShuttingDown)
                | (ShuttingDown, Terminated)
        )
    }

    /// Whether the machine has finished.
    pub fn is_terminal(self) -> bool {
        self == MachineState::Terminated
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MachineState::Initializing => "INITIALIZING",
            MachineState::Connecting => "CONNECTING",
            MachineState::Running => "RUNNING",
            MachineState::ShuttingDown => "SHUTTING_DOWN",
            MachineState::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

/// Owner side of a machine's state, observable through [`watch`].
pub(crate) struct Lifecycle {
    machine: MachineId,
    state: watch::Sender<MachineState>,
}

impl Lifecycle {
    pub fn new(machine: MachineId) -> Self {
        let (state, _) = watch::channel(MachineState::Initializing);
        Self { machine, state }
    }

    pub fn current(&self) -> MachineState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<MachineState> {
        self.state.subscribe()
    }

    /// Move to `next` if that is a legal transition. Returns whether the
    /// state changed.
    pub fn advance(&self, next: MachineState) -> bool {
        let mut from = None;
        let changed = self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                from = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });
        match from {
            Some(from) => {
                info!(machine = self.machine.get(), %from, to = %next, "State transition");
            }
            None => {
                debug!(
                    machine = self.machine.get(),
                    current = %self.current(),
                    requested = %next,
                    "Ignoring illegal state transition"
                );
            }
        }
        changed
    }
}
