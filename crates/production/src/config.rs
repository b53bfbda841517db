//! Configuration types for a machine.

use lamport_core::QueueConfig;
use lamport_node::{EventRangeError, EventRanges};
use lamport_types::{MachineId, PeerTable};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration, detected before the machine is created.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Clock rate range {min}..={max} is empty")]
    EmptyClockRateRange { min: u32, max: u32 },

    #[error("Clock rate must be at least one tick per second")]
    ZeroClockRate,

    #[error("Retry policy needs at least one attempt")]
    ZeroRetryAttempts,

    #[error("Invalid event ranges: {0}")]
    Events(#[from] EventRangeError),

    #[error("{0} lists itself as a peer")]
    PeerIsSelf(MachineId),

    #[error("{0} is listed more than once")]
    DuplicatePeer(MachineId),

    #[error("Grace period must be non-zero")]
    ZeroGracePeriod,

    #[error("Bounded queue needs a capacity of at least one")]
    ZeroQueueCapacity,
}

/// Range the machine's clock rate (ticks per second) is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockRateRange {
    pub min: u32,
    pub max: u32,
}

impl Default for ClockRateRange {
    fn default() -> Self {
        Self { min: 1, max: 6 }
    }
}

impl ClockRateRange {
    /// A range that always yields `rate`.
    pub fn fixed(rate: u32) -> Self {
        Self {
            min: rate,
            max: rate,
        }
    }

    /// Draw a rate uniformly from the range.
    pub fn sample(&self, rng: &mut impl Rng) -> u32 {
        rng.gen_range(self.min..=self.max)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.min > self.max {
            return Err(ConfigError::EmptyClockRateRange {
                min: self.min,
                max: self.max,
            });
        }
        if self.min == 0 {
            return Err(ConfigError::ZeroClockRate);
        }
        Ok(())
    }
}

/// Time between ticks for a given rate.
pub fn tick_interval(rate: u32) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(rate.max(1)))
}

/// How the delay grows between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed,
    /// Delay multiplied by `factor` after each failed attempt.
    Exponential { factor: u32 },
}

/// Connect-with-retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Growth of the delay.
    pub backoff: Backoff,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            backoff: Backoff::Exponential { factor: 2 },
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Fixed delay between `max_attempts` attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            backoff: Backoff::Fixed,
            max_delay: delay,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            Backoff::Fixed => self.initial_delay,
            Backoff::Exponential { factor } => {
                let exponent = attempt.saturating_sub(1).min(16);
                self.initial_delay
                    .saturating_mul(factor.max(1).saturating_pow(exponent))
            }
        };
        delay.min(self.max_delay)
    }
}

/// Configuration for one machine.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// This machine's identity.
    pub id: MachineId,

    /// Address the listener binds to.
    pub listen_addr: SocketAddr,

    /// Every other machine and its address.
    pub peers: Vec<(MachineId, SocketAddr)>,

    /// Range the clock rate is drawn from.
    pub clock_rate: ClockRateRange,

    /// Outbound connect-with-retry policy.
    pub retry: RetryPolicy,

    /// Timeout for a single connect attempt (and for reading a hello).
    pub connect_timeout: Duration,

    /// How long to wait for every lower-id peer to dial in.
    pub accept_timeout: Duration,

    /// Timeout for one frame write.
    pub write_timeout: Duration,

    /// Bound on graceful resource release at shutdown.
    pub grace_period: Duration,

    /// Event value boundaries.
    pub events: EventRanges,

    /// Inbound queue capacity policy.
    pub queue: QueueConfig,

    /// Seed for the clock rate and event draws. `None` seeds from entropy.
    pub seed: Option<u64>,

    /// Directory for the per-machine JSON-lines event log.
    pub log_dir: Option<PathBuf>,
}

impl MachineConfig {
    /// Create a configuration with defaults and no peers.
    pub fn new(id: MachineId, listen_addr: SocketAddr) -> Self {
        Self {
            id,
            listen_addr,
            peers: Vec::new(),
            clock_rate: ClockRateRange::default(),
            retry: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(5),
            accept_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(2),
            grace_period: Duration::from_secs(5),
            events: EventRanges::default(),
            queue: QueueConfig::default(),
            seed: None,
            log_dir: None,
        }
    }

    /// Add a peer.
    pub fn with_peer(mut self, id: MachineId, addr: SocketAddr) -> Self {
        self.peers.push((id, addr));
        self
    }

    /// Add several peers.
    pub fn with_peers(mut self, peers: impl IntoIterator<Item = (MachineId, SocketAddr)>) -> Self {
        self.peers.extend(peers);
        self
    }

    /// Set the clock rate range.
    pub fn with_clock_rate(mut self, range: ClockRateRange) -> Self {
        self.clock_rate = range;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-attempt connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set how long to wait for inbound peers.
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Set the frame write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the shutdown grace period.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Set the event ranges.
    pub fn with_events(mut self, events: EventRanges) -> Self {
        self.events = events;
        self
    }

    /// Set the queue capacity policy.
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Set the random seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the event log directory.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.clock_rate.validate()?;
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroRetryAttempts);
        }
        self.events.validate()?;
        if self.grace_period.is_zero() {
            return Err(ConfigError::ZeroGracePeriod);
        }
        if self.queue.max_pending == Some(0) {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        let mut seen = HashSet::new();
        for (peer, _) in &self.peers {
            if *peer == self.id {
                return Err(ConfigError::PeerIsSelf(*peer));
            }
            if !seen.insert(*peer) {
                return Err(ConfigError::DuplicatePeer(*peer));
            }
        }
        Ok(())
    }

    /// The peer table built from `peers`.
    pub fn peer_table(&self) -> PeerTable {
        PeerTable::from_entries(self.id, self.peers.iter().copied())
    }
}
