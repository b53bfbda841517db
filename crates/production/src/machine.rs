//! A running machine: network, event loop and sink tied to one lifecycle.
//!
//! [`Machine::run`] drives the whole life of the machine on the current task.
//! It binds, connects to every peer, ticks at the machine's clock rate until a
//! shutdown is requested through a [`MachineHandle`], then closes the network
//! within the grace period.

use crate::config::{tick_interval, ConfigError, MachineConfig};
use crate::error::{MachineError, ShutdownError};
use crate::lifecycle::{Lifecycle, MachineState};
use crate::network::Network;
use lamport_core::{
    DrawSource, EventSink, FanoutSink, JsonLinesSink, MessageQueue, SeededDraws, TracingSink,
};
use lamport_node::EventLoop;
use lamport_types::{unix_millis, MachineId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Summary returned when a machine terminates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineReport {
    pub id: MachineId,
    /// Ticks per second this machine ran at.
    pub clock_rate: u32,
    /// Events processed.
    pub ticks: u64,
    /// Logical clock at termination.
    pub final_clock: u64,
    /// Individual sends that failed.
    pub send_failures: u64,
    /// Peers whose most recent send failed.
    pub suspect_peers: Vec<MachineId>,
    /// Set when resources had to be released forcibly after the grace period.
    pub degraded: bool,
}

/// One simulated machine.
pub struct Machine {
    config: MachineConfig,
    clock_rate: u32,
    sink: Arc<dyn EventSink>,
    draws: Box<dyn DrawSource>,
    lifecycle: Lifecycle,
    stop: CancellationToken,
}

impl Machine {
    /// Validate `config` and pick the clock rate.
    ///
    /// With a seed, the clock rate and the event draws are reproducible.
    pub fn new(config: MachineConfig, sink: Arc<dyn EventSink>) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let clock_rate = config.clock_rate.sample(&mut rng);
        let draws = SeededDraws::new(rng.gen());

        info!(machine = config.id.get(), clock_rate, "Machine initialized");
        Ok(Self {
            lifecycle: Lifecycle::new(config.id),
            config,
            clock_rate,
            sink,
            draws: Box::new(draws),
            stop: CancellationToken::new(),
        })
    }

    /// Replace the event draw source.
    pub fn with_draws(mut self, draws: impl DrawSource + 'static) -> Self {
        self.draws = Box::new(draws);
        self
    }

    pub fn id(&self) -> MachineId {
        self.config.id
    }

    /// Ticks per second.
    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    pub fn state(&self) -> MachineState {
        self.lifecycle.current()
    }

    /// A handle for observing the machine and requesting shutdown.
    pub fn handle(&self) -> MachineHandle {
        MachineHandle {
            id: self.config.id,
            stop: self.stop.clone(),
            state: self.lifecycle.subscribe(),
        }
    }

    /// Run until shutdown is requested.
    ///
    /// Returns an error only if the mesh cannot be established; the machine
    /// never reaches `Running` in that case. Everything after that is logged
    /// and summarized in the report.
    pub async fn run(self) -> Result<MachineReport, MachineError> {
        let Machine {
            config,
            clock_rate,
            sink,
            draws,
            lifecycle,
            stop,
        } = self;
        let id = config.id;

        lifecycle.advance(MachineState::Connecting);
        let queue = Arc::new(MessageQueue::new(&config.queue));
        let mut network = match Network::establish(&config, Arc::clone(&queue), &stop).await {
            Ok(network) => network,
            Err(e) => {
                warn!(machine = id.get(), error = %e, "Startup failed");
                if stop.is_cancelled() {
                    lifecycle.advance(MachineState::ShuttingDown);
                }
                lifecycle.advance(MachineState::Terminated);
                return Err(e.into());
            }
        };

        let mut event_loop = EventLoop::new(
            id,
            config.peers.iter().map(|(peer, _)| *peer),
            queue,
            config.events.clone(),
            draws,
        );
        lifecycle.advance(MachineState::Running);
        debug!(machine = id.get(), peers = ?network.connected_peers(), "Links up");

        let mut interval = tokio::time::interval(tick_interval(clock_rate));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut send_failures = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = interval.tick() => {}
            }

            let mut tick = event_loop.step();
            for outbound in &tick.outbound {
                if let Err(e) = network.send(outbound.to, &outbound.message).await {
                    send_failures += 1;
                    warn!(
                        machine = id.get(),
                        peer = outbound.to.get(),
                        clock = outbound.message.clock,
                        error = %e,
                        "Send failed"
                    );
                    tick.record.undelivered.push(outbound.to);
                }
            }
            // Stamped after the sends, which may block up to the write timeout.
            tick.record.system_time_ms = unix_millis(SystemTime::now());
            sink.record(&tick.record);
        }

        lifecycle.advance(MachineState::ShuttingDown);
        let suspect_peers = network.suspected_peers();
        let degraded = match network.shutdown(config.grace_period).await {
            Ok(()) => false,
            Err(ShutdownError::Timeout { receivers, writers }) => {
                warn!(
                    machine = id.get(),
                    receivers,
                    writers,
                    "Forced shutdown after grace period"
                );
                true
            }
        };
        drop(network);

        let report = MachineReport {
            id,
            clock_rate,
            ticks: event_loop.ticks(),
            final_clock: event_loop.clock(),
            send_failures,
            suspect_peers,
            degraded,
        };
        lifecycle.advance(MachineState::Terminated);
        info!(
            machine = id.get(),
            ticks = report.ticks,
            final_clock = report.final_clock,
            send_failures,
            degraded,
            "Machine terminated"
        );
        Ok(report)
    }
}

/// Cloneable control handle for a [`Machine`].
#[derive(Clone)]
pub struct MachineHandle {
    id: MachineId,
    stop: CancellationToken,
    state: watch::Receiver<MachineState>,
}

impl MachineHandle {
    pub fn id(&self) -> MachineId {
        self.id
    }

    /// Request shutdown. Returns `false` if shutdown was already requested.
    pub fn shutdown(&self) -> bool {
        if self.stop.is_cancelled() {
            return false;
        }
        self.stop.cancel();
        true
    }

    /// Most recently published state.
    pub fn state(&self) -> MachineState {
        *self.state.borrow()
    }

    /// Wait until the machine reaches a given state or any later one.
    pub async fn wait_for(&self, target: MachineState) -> MachineState {
        let mut state = self.state.clone();
        let reached = state.wait_for(|s| *s >= target).await.map(|s| *s);
        // Err means the machine was dropped without finishing `run`.
        reached.unwrap_or_else(|_| *state.borrow())
    }

    /// Wait until the machine has terminated.
    pub async fn wait_terminated(&self) {
        self.wait_for(MachineState::Terminated).await;
    }
}

/// The sink a machine logs to by default: structured `tracing` events, plus a
/// JSON-lines file when `log_dir` is configured.
pub fn sink_for(config: &MachineConfig) -> Result<Arc<dyn EventSink>, MachineError> {
    let Some(dir) = &config.log_dir else {
        return Ok(Arc::new(TracingSink));
    };
    let file = JsonLinesSink::in_dir(dir, config.id).map_err(MachineError::EventLog)?;
    info!(machine = config.id.get(), path = %file.path().display(), "Writing event log");
    Ok(Arc::new(
        FanoutSink::new()
            .with(Arc::new(TracingSink))
            .with(Arc::new(file)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClockRateRange;
    use lamport_core::MemorySink;
    use std::net::SocketAddr;

    fn config(id: u32) -> MachineConfig {
        MachineConfig::new(MachineId(id), SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Machine::new(
            config(1).with_peer(MachineId(1), SocketAddr::from(([127, 0, 0, 1], 1))),
            Arc::new(MemorySink::new()),
        );
        assert!(matches!(result, Err(ConfigError::PeerIsSelf(MachineId(1)))));
    }

    #[test]
    fn test_seeded_clock_rate_is_reproducible() {
        let a = Machine::new(config(1).with_seed(42), Arc::new(MemorySink::new())).unwrap();
        let b = Machine::new(config(1).with_seed(42), Arc::new(MemorySink::new())).unwrap();
        assert_eq!(a.clock_rate(), b.clock_rate());
        assert!((1..=6).contains(&a.clock_rate()));
    }

    #[test]
    fn test_fixed_clock_rate() {
        let machine = Machine::new(
            config(1).with_clock_rate(ClockRateRange::fixed(4)),
            Arc::new(MemorySink::new()),
        )
        .unwrap();
        assert_eq!(machine.clock_rate(), 4);
        assert_eq!(machine.state(), MachineState::Initializing);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let machine = Machine::new(config(1), Arc::new(MemorySink::new())).unwrap();
        let handle = machine.handle();
        assert!(handle.shutdown());
        assert!(!handle.shutdown());
        assert!(!handle.clone().shutdown());
    }

    #[tokio::test]
    async fn test_lone_machine_runs_and_stops() {
        let sink = MemorySink::new();
        let machine = Machine::new(
            config(1).with_clock_rate(ClockRateRange::fixed(6)).with_seed(7),
            Arc::new(sink.clone()),
        )
        .unwrap();
        let handle = machine.handle();
        let task = tokio::spawn(machine.run());

        handle.wait_for(MachineState::Running).await;
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        handle.shutdown();

        let report = task.await.unwrap().unwrap();
        assert_eq!(handle.state(), MachineState::Terminated);
        assert!(!report.degraded);
        assert!(report.ticks >= 1);
        assert_eq!(report.ticks, sink.len() as u64);
        // With no peers every event is internal.
        assert_eq!(report.final_clock, report.ticks);
        assert_eq!(report.send_failures, 0);
        assert!(report.suspect_peers.is_empty());
    }

    /// Notes the wall clock at the moment each record arrives.
    #[derive(Clone, Default)]
    struct ArrivalSink(Arc<parking_lot::Mutex<Vec<(u64, u64)>>>);

    impl EventSink for ArrivalSink {
        fn record(&self, record: &lamport_types::EventRecord) {
            let arrived = unix_millis(SystemTime::now());
            self.0.lock().push((record.system_time_ms, arrived));
        }
    }

    #[tokio::test]
    async fn test_records_stamped_at_log_time() {
        let sink = ArrivalSink::default();
        let machine = Machine::new(
            config(1).with_clock_rate(ClockRateRange::fixed(6)),
            Arc::new(sink.clone()),
        )
        .unwrap();
        let handle = machine.handle();
        let task = tokio::spawn(machine.run());

        handle.wait_for(MachineState::Running).await;
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        handle.shutdown();
        task.await.unwrap().unwrap();

        let stamps = sink.0.lock().clone();
        assert!(!stamps.is_empty());
        for (stamped, arrived) in &stamps {
            assert!(stamped <= arrived);
            assert!(arrived - stamped < 50);
        }
        for pair in stamps.windows(2) {
            assert!(pair[1].0 >= pair[0].0);
        }
    }

    #[tokio::test]
    async fn test_sink_for_writes_into_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(3).with_log_dir(dir.path());
        let sink = sink_for(&config).unwrap();
        sink.record(&lamport_types::EventRecord::now(
            MachineId(3),
            lamport_types::EventKind::Internal,
            1,
        ));
        let contents = std::fs::read_to_string(dir.path().join("machine_3.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }
}
