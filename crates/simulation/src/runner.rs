//! Deterministic simulation runner.

use crate::event_queue::{EventKey, SimEvent};
use crate::ledger::{DeliveryLedger, LedgerError};
use lamport_core::{EventSink, MessageQueue, QueueConfig, SeededDraws};
use lamport_node::{EventLoop, EventRanges};
use lamport_types::{EventKind, EventRecord, MachineId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Invalid simulation setup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SimulationError {
    #[error("Simulation needs at least one machine")]
    NoMachines,

    #[error("Clock rate range {min}..={max} is empty or includes zero")]
    InvalidClockRates { min: u32, max: u32 },

    #[error("Explicit clock rates given for {given} machines, expected {expected}")]
    RateCountMismatch { given: usize, expected: usize },
}

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Machines are numbered `1..=machines`.
    pub machines: u32,
    /// Seed for clock rates and event draws.
    pub seed: u64,
    /// Delay between a send and the message landing in the peer's queue.
    pub latency: Duration,
    /// Range clock rates are drawn from, in ticks per second.
    pub min_rate: u32,
    pub max_rate: u32,
    /// Fixed per-machine rates, overriding the drawn ones.
    pub rates: Option<Vec<u32>>,
    pub events: EventRanges,
    pub queue: QueueConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            machines: 3,
            seed: 0,
            latency: Duration::from_millis(1),
            min_rate: 1,
            max_rate: 6,
            rates: None,
            events: EventRanges::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl SimulationConfig {
    pub fn new(machines: u32) -> Self {
        Self {
            machines,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_rate_range(mut self, min: u32, max: u32) -> Self {
        self.min_rate = min;
        self.max_rate = max;
        self
    }

    /// Use exactly these rates, one per machine in id order.
    pub fn with_rates(mut self, rates: Vec<u32>) -> Self {
        self.rates = Some(rates);
        self
    }

    pub fn with_events(mut self, events: EventRanges) -> Self {
        self.events = events;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    fn validate(&self) -> Result<(), SimulationError> {
        if self.machines == 0 {
            return Err(SimulationError::NoMachines);
        }
        let invalid = |min: u32, max: u32| min == 0 || min > max;
        if invalid(self.min_rate, self.max_rate) {
            return Err(SimulationError::InvalidClockRates {
                min: self.min_rate,
                max: self.max_rate,
            });
        }
        if let Some(rates) = &self.rates {
            if rates.len() != self.machines as usize {
                return Err(SimulationError::RateCountMismatch {
                    given: rates.len(),
                    expected: self.machines as usize,
                });
            }
            if let Some(&bad) = rates.iter().find(|r| **r == 0) {
                return Err(SimulationError::InvalidClockRates { min: bad, max: bad });
            }
        }
        Ok(())
    }
}

/// Per-machine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub clock_rate: u32,
    pub ticks: u64,
    pub internal: u64,
    /// Send events, not messages: a send to both peers counts once.
    pub sends: u64,
    pub messages_sent: u64,
    pub received: u64,
    pub max_queue_len: usize,
    pub max_drift: u64,
    pub final_clock: u64,
}

/// Statistics collected during a run.
#[derive(Debug, Clone, Default)]
pub struct SimulationStats {
    pub events_processed: u64,
    pub deliveries: u64,
    /// Messages rejected by a bounded queue.
    pub messages_dropped: u64,
    pub nodes: BTreeMap<MachineId, NodeStats>,
}

struct SimNode {
    event_loop: EventLoop,
    interval: Duration,
    records: Vec<EventRecord>,
}

/// Drives every machine's event loop on one simulated timeline.
///
/// Given the same configuration (including the seed) two runs produce
/// identical records.
pub struct SimulationRunner {
    now: Duration,
    sequence: u64,
    events: BTreeMap<EventKey, SimEvent>,
    nodes: BTreeMap<MachineId, SimNode>,
    latency: Duration,
    ledger: DeliveryLedger,
    stats: SimulationStats,
    sink: Option<Arc<dyn EventSink>>,
}

impl SimulationRunner {
    /// Build a runner and schedule each machine's first tick at time zero.
    pub fn new(config: SimulationConfig) -> Result<Self, SimulationError> {
        config.validate()?;
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let ids: Vec<MachineId> = (1..=config.machines).map(MachineId).collect();

        let mut runner = Self {
            now: Duration::ZERO,
            sequence: 0,
            events: BTreeMap::new(),
            nodes: BTreeMap::new(),
            latency: config.latency,
            ledger: DeliveryLedger::new(),
            stats: SimulationStats::default(),
            sink: None,
        };

        for (index, &id) in ids.iter().enumerate() {
            let rate = match &config.rates {
                Some(rates) => rates[index],
                None => rng.gen_range(config.min_rate..=config.max_rate),
            };
            let draws = SeededDraws::new(rng.gen());
            let event_loop = EventLoop::new(
                id,
                ids.iter().copied(),
                Arc::new(MessageQueue::new(&config.queue)),
                config.events.clone(),
                Box::new(draws),
            );
            debug!(machine = id.get(), rate, "Simulated machine created");
            runner.nodes.insert(
                id,
                SimNode {
                    event_loop,
                    interval: Duration::from_nanos(1_000_000_000 / u64::from(rate)),
                    records: Vec::new(),
                },
            );
            runner.stats.nodes.insert(
                id,
                NodeStats {
                    clock_rate: rate,
                    ..NodeStats::default()
                },
            );
            runner.schedule(id, Duration::ZERO, SimEvent::Tick);
        }
        Ok(runner)
    }

    /// Also forward every record to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Current simulated time.
    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn ledger(&self) -> &DeliveryLedger {
        &self.ledger
    }

    /// Records produced by `machine`, in processing order.
    pub fn records(&self, machine: MachineId) -> &[EventRecord] {
        self.nodes
            .get(&machine)
            .map(|n| n.records.as_slice())
            .unwrap_or(&[])
    }

    /// Messages sent but not yet in a queue.
    pub fn in_flight(&self) -> usize {
        self.events
            .values()
            .filter(|e| matches!(e, SimEvent::Deliver(_)))
            .count()
    }

    /// Messages waiting in queues.
    pub fn queued(&self) -> usize {
        self.nodes
            .values()
            .map(|n| n.event_loop.queue().len())
            .sum()
    }

    /// Check exactly-once delivery so far, and that every outstanding
    /// message is either in flight or queued.
    pub fn verify(&self) -> Result<(), LedgerError> {
        self.ledger.verify()?;
        let outstanding = self.ledger.outstanding().len();
        let accounted =
            self.in_flight() + self.queued() + self.stats.messages_dropped as usize;
        if outstanding != accounted {
            return Err(LedgerError::Lost {
                outstanding,
                accounted,
            });
        }
        Ok(())
    }

    fn schedule(&mut self, machine: MachineId, time: Duration, event: SimEvent) {
        self.sequence += 1;
        let key = EventKey::new(time, &event, machine, self.sequence);
        self.events.insert(key, event);
    }

    /// Process every event scheduled at or before `end`.
    pub fn run_until(&mut self, end: Duration) {
        while let Some((&key, _)) = self.events.first_key_value() {
            if key.time > end {
                debug!(remaining = self.events.len(), "Time limit reached");
                break;
            }
            self.step();
        }
        self.now = self.now.max(end);
    }

    /// Process the next event. Returns false when nothing is scheduled.
    pub fn step(&mut self) -> bool {
        let Some((key, event)) = self.events.pop_first() else {
            return false;
        };
        self.now = key.time;
        self.stats.events_processed += 1;
        trace!(time = ?self.now, machine = key.machine.get(), ?event, "Processing event");

        match event {
            SimEvent::Deliver(message) => self.deliver(key.machine, message),
            SimEvent::Tick => self.tick(key.machine),
        }
        true
    }

    fn deliver(&mut self, to: MachineId, message: lamport_types::Message) {
        let Some(node) = self.nodes.get(&to) else {
            return;
        };
        match node.event_loop.queue().enqueue(message) {
            Ok(len) => {
                self.stats.deliveries += 1;
                if let Some(stats) = self.stats.nodes.get_mut(&to) {
                    stats.max_queue_len = stats.max_queue_len.max(len);
                }
            }
            Err(e) => {
                self.stats.messages_dropped += 1;
                warn!(machine = to.get(), error = %e, "Dropping simulated message");
            }
        }
    }

    fn tick(&mut self, machine: MachineId) {
        let Some(node) = self.nodes.get_mut(&machine) else {
            return;
        };
        let mut tick = node.event_loop.step();
        tick.record.system_time_ms = self.now.as_millis() as u64;
        let next = self.now + node.interval;
        let clock = node.event_loop.clock();
        node.records.push(tick.record.clone());

        if let Some(stats) = self.stats.nodes.get_mut(&machine) {
            stats.ticks += 1;
            stats.final_clock = clock;
            match &tick.record.kind {
                EventKind::Internal => stats.internal += 1,
                EventKind::Receive { .. } => {
                    stats.received += 1;
                    stats.max_drift = stats.max_drift.max(tick.record.drift().unwrap_or(0));
                }
                _ => {
                    stats.sends += 1;
                    stats.messages_sent += tick.outbound.len() as u64;
                }
            }
        }

        self.ledger.observe(&tick.record);
        if let Some(sink) = &self.sink {
            sink.record(&tick.record);
        }

        let deliver_at = self.now + self.latency;
        for outbound in std::mem::take(&mut tick.outbound) {
            self.schedule(outbound.to, deliver_at, SimEvent::Deliver(outbound.message));
        }
        self.schedule(machine, next, SimEvent::Tick);
    }
}
