//! Lamport logical clock.

use std::fmt;

/// A Lamport logical clock.
///
/// Single-writer: only the owning machine's event loop advances it, so no
/// synchronization is needed. The value never decreases.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LogicalClock {
    value: u64,
}

impl LogicalClock {
    /// Create a clock at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Advance for a local or send event. Returns the new value.
    pub fn tick(&mut self) -> u64 {
        self.value += 1;
        self.value
    }

    /// Advance for a receive event: `max(local, remote) + 1`. Returns the new value.
    pub fn observe(&mut self, remote: u64) -> u64 {
        self.value = self.value.max(remote) + 1;
        self.value
    }
}

impl fmt::Display for LogicalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_at_zero() {
        assert_eq!(LogicalClock::new().value(), 0);
    }

    #[test]
    fn test_tick_increments_by_one() {
        let mut clock = LogicalClock::new();
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
        assert_eq!(clock.value(), 2);
    }

    #[test]
    fn test_observe_jumps_past_remote() {
        let mut clock = LogicalClock::new();
        assert_eq!(clock.observe(5), 6);
    }

    #[test]
    fn test_observe_behind_remote_still_advances() {
        let mut clock = LogicalClock::new();
        for _ in 0..10 {
            clock.tick();
        }
        assert_eq!(clock.observe(3), 11);
    }

    #[test]
    fn test_observe_sequence() {
        let mut clock = LogicalClock::new();
        for remote in [5, 8, 3, 10] {
            clock.observe(remote);
        }
        assert_eq!(clock.value(), 11);
    }
}
