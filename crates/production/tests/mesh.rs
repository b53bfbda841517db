//! End-to-end tests over loopback TCP.

use futures::{SinkExt, StreamExt};
use lamport_core::{MemorySink, MessageQueue, QueueConfig, ScriptedDraws};
use lamport_production::network::{decode_frame, encode_frame, frame_codec, WireFrame};
use lamport_production::{
    ClockRateRange, ConnectionError, Machine, MachineConfig, MachineError, MachineHandle,
    MachineReport, MachineState, Network, RetryPolicy, TransmissionError,
};
use lamport_types::{EventKind, MachineId, Message};
use std::collections::HashSet;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, FramedRead};
use tokio_util::sync::CancellationToken;

/// Reserve `n` distinct loopback addresses by binding port 0.
fn free_addrs(n: usize) -> Vec<SocketAddr> {
    let listeners: Vec<_> = (0..n)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    listeners.iter().map(|l| l.local_addr().unwrap()).collect()
}

fn mesh_config(id: u32, addrs: &[SocketAddr]) -> MachineConfig {
    let peers = addrs
        .iter()
        .enumerate()
        .map(|(i, addr)| (MachineId(i as u32 + 1), *addr))
        .filter(|(peer, _)| peer.get() != id);
    MachineConfig::new(MachineId(id), addrs[id as usize - 1])
        .with_peers(peers)
        .with_clock_rate(ClockRateRange::fixed(6))
        .with_retry(RetryPolicy::fixed(40, Duration::from_millis(50)))
        .with_connect_timeout(Duration::from_secs(1))
        .with_accept_timeout(Duration::from_secs(10))
        .with_grace_period(Duration::from_secs(2))
        .with_seed(u64::from(id))
}

struct Running {
    handle: MachineHandle,
    sink: MemorySink,
    task: JoinHandle<Result<MachineReport, MachineError>>,
}

fn spawn(config: MachineConfig, draw: u32) -> Running {
    let sink = MemorySink::new();
    let machine = Machine::new(config, Arc::new(sink.clone()))
        .unwrap()
        .with_draws(ScriptedDraws::constant(draw));
    let handle = machine.handle();
    let task = tokio::spawn(machine.run());
    Running { handle, sink, task }
}

#[tokio::test]
async fn test_three_machines_exchange_messages() {
    let addrs = free_addrs(3);
    // Machine 1 always sends to its lowest peer (2); 2 and 3 stay internal.
    let machines = vec![
        spawn(mesh_config(1, &addrs), 1),
        spawn(mesh_config(2, &addrs), 4),
        spawn(mesh_config(3, &addrs), 4),
    ];
    for m in &machines {
        tokio::time::timeout(Duration::from_secs(10), m.handle.wait_for(MachineState::Running))
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(1500)).await;
    for m in &machines {
        m.handle.shutdown();
    }

    let mut sinks = Vec::new();
    for m in machines {
        let report = m.task.await.unwrap().unwrap();
        assert!(!report.degraded);
        assert_eq!(m.handle.state(), MachineState::Terminated);
        sinks.push(m.sink.records());
    }

    // Every machine's clock strictly increases, one record per tick.
    for records in &sinks {
        assert!(!records.is_empty());
        for pair in records.windows(2) {
            assert!(pair[1].logical_clock > pair[0].logical_clock);
        }
    }

    // Everything machine 2 received was sent by machine 1, exactly once.
    let sent: HashSet<u64> = sinks[0]
        .iter()
        .filter(|r| r.undelivered.is_empty())
        .map(|r| {
            assert_eq!(r.kind, EventKind::SendOne { to: MachineId(2) });
            r.logical_clock
        })
        .collect();
    let mut received = HashSet::new();
    for record in &sinks[1] {
        if let EventKind::Receive {
            from, sender_clock, ..
        } = record.kind
        {
            assert_eq!(from, MachineId(1));
            assert!(record.logical_clock > sender_clock);
            assert!(sent.contains(&sender_clock));
            assert!(received.insert(sender_clock), "duplicate delivery");
        }
    }
    assert!(!received.is_empty());

    // Machine 3 was never a target.
    assert!(sinks[2].iter().all(|r| r.kind == EventKind::Internal));
}

#[tokio::test]
async fn test_retry_exhaustion_is_fatal() {
    let addrs = free_addrs(2);
    let config = MachineConfig::new(MachineId(1), addrs[0])
        .with_peer(MachineId(2), addrs[1])
        .with_retry(RetryPolicy::fixed(3, Duration::from_millis(20)))
        .with_connect_timeout(Duration::from_millis(200));
    let sink = MemorySink::new();
    let machine = Machine::new(config, Arc::new(sink.clone())).unwrap();
    let handle = machine.handle();

    let result = machine.run().await;
    match result {
        Err(MachineError::Connection(ConnectionError::Exhausted { peer, attempts, .. })) => {
            assert_eq!(peer, MachineId(2));
            assert_eq!(attempts, 3);
        }
        other => panic!("expected exhausted retries, got {other:?}"),
    }
    assert_eq!(handle.state(), MachineState::Terminated);
    assert!(sink.is_empty());
}

#[tokio::test]
async fn test_shutdown_during_connect() {
    let addrs = free_addrs(2);
    // Machine 2 waits for machine 1, which never dials.
    let running = spawn(mesh_config(2, &addrs), 4);
    tokio::time::timeout(Duration::from_secs(5), running.handle.wait_for(MachineState::Connecting))
        .await
        .unwrap();

    assert!(running.handle.shutdown());
    let result = tokio::time::timeout(Duration::from_secs(5), running.task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        result,
        Err(MachineError::Connection(ConnectionError::Cancelled))
    ));
    assert_eq!(running.handle.state(), MachineState::Terminated);
    assert!(running.sink.is_empty());
}

#[tokio::test]
async fn test_shutdown_within_grace_and_idempotent() {
    let addrs = free_addrs(2);
    let machines = vec![
        spawn(mesh_config(1, &addrs), 1),
        spawn(mesh_config(2, &addrs), 1),
    ];
    for m in &machines {
        tokio::time::timeout(Duration::from_secs(10), m.handle.wait_for(MachineState::Running))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    for m in &machines {
        assert!(m.handle.shutdown());
        assert!(!m.handle.shutdown());
    }
    for m in machines {
        let report = tokio::time::timeout(Duration::from_secs(3), m.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!report.degraded);
        assert!(report.ticks >= 1);
        assert!(!m.handle.shutdown());
        assert_eq!(m.handle.state(), MachineState::Terminated);
    }
}

#[tokio::test]
async fn test_undecodable_frame_drops_only_that_connection() {
    let addrs = free_addrs(2);
    // The test plays machine 1; machine 2 always sends to it.
    let running = spawn(mesh_config(2, &addrs), 1);

    let stream = loop {
        match TcpStream::connect(addrs[1]).await {
            Ok(stream) => break stream,
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    };
    let mut framed = Framed::new(stream, frame_codec());
    framed
        .send(encode_frame(&WireFrame::Hello { machine: MachineId(1) }).unwrap())
        .await
        .unwrap();
    framed
        .send(encode_frame(&WireFrame::Clock(Message::new(MachineId(1), 5))).unwrap())
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), running.handle.wait_for(MachineState::Running))
        .await
        .unwrap();

    // Clock messages arrive from machine 2.
    let frame = tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(
        decode_frame(&frame).unwrap(),
        WireFrame::Clock(Message { sender: MachineId(2), .. })
    ));

    framed.send(bytes::Bytes::from_static(b"not json")).await.unwrap();

    // Machine 2 closes the connection; drain whatever it sent before that.
    let mut stream = framed.into_inner();
    let mut buf = [0u8; 1024];
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await
    .unwrap();

    // The machine keeps ticking and reports sends to the lost peer.
    let before = running.sink.len();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(running.sink.len() > before);
    assert_eq!(running.handle.state(), MachineState::Running);

    running.handle.shutdown();
    let report = running.task.await.unwrap().unwrap();
    assert!(report.send_failures > 0);
    assert_eq!(report.suspect_peers, vec![MachineId(1)]);

    let records = running.sink.records();
    let receive = records
        .iter()
        .find(|r| matches!(r.kind, EventKind::Receive { .. }))
        .unwrap();
    assert!(matches!(
        receive.kind,
        EventKind::Receive {
            from: MachineId(1),
            sender_clock: 5,
            queue_len_after: 0,
            ..
        }
    ));
    assert_eq!(receive.logical_clock, 6);
    assert!(records
        .iter()
        .any(|r| r.undelivered == vec![MachineId(1)]));
}

/// Accept machine 1's dial on `addr` and consume its hello, playing machine 2.
async fn accept_as_peer(listener: &tokio::net::TcpListener) -> TcpStream {
    let (stream, _) = listener.accept().await.unwrap();
    let mut framed = Framed::new(stream, frame_codec());
    let hello = framed.next().await.unwrap().unwrap();
    assert_eq!(
        decode_frame(&hello).unwrap(),
        WireFrame::Hello { machine: MachineId(1) }
    );
    framed.into_inner()
}

#[tokio::test]
async fn test_stalled_peer_forces_degraded_shutdown() {
    let addrs = free_addrs(2);
    let listener = tokio::net::TcpListener::bind(addrs[1]).await.unwrap();
    let running = spawn(
        mesh_config(1, &addrs).with_grace_period(Duration::from_millis(300)),
        4,
    );

    // Holds the connection open and never closes its end.
    let _stalled = accept_as_peer(&listener).await;
    tokio::time::timeout(Duration::from_secs(5), running.handle.wait_for(MachineState::Running))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = std::time::Instant::now();
    running.handle.shutdown();
    let report = tokio::time::timeout(Duration::from_secs(3), running.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(report.degraded);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(running.handle.state(), MachineState::Terminated);
}

#[tokio::test]
async fn test_timed_out_send_is_not_delivered() {
    let addrs = free_addrs(2);
    let listener = tokio::net::TcpListener::bind(addrs[1]).await.unwrap();
    let config = mesh_config(1, &addrs).with_write_timeout(Duration::from_millis(20));
    let queue = Arc::new(MessageQueue::new(&QueueConfig::default()));
    let cancel = CancellationToken::new();

    let (network, peer) = tokio::join!(
        Network::establish(&config, queue, &cancel),
        accept_as_peer(&listener)
    );
    let network = network.unwrap();

    // The peer never reads, so the socket buffers eventually fill.
    let payload = "x".repeat(32 * 1024);
    let mut sent = Vec::new();
    let mut timed_out = None;
    for clock in 1..=10_000u64 {
        let message = Message::new(MachineId(1), clock).with_payload(payload.clone());
        match network.send(MachineId(2), &message).await {
            Ok(()) => sent.push(clock),
            Err(TransmissionError::Timeout(peer)) => {
                assert_eq!(peer, MachineId(2));
                timed_out = Some(clock);
                break;
            }
            Err(e) => panic!("unexpected send error: {e}"),
        }
    }
    let timed_out = timed_out.expect("send never timed out");

    // The link is gone; later sends fail fast.
    assert!(network.connected_peers().is_empty());
    assert_eq!(network.suspected_peers(), vec![MachineId(2)]);
    assert!(matches!(
        network.send(MachineId(2), &Message::new(MachineId(1), timed_out + 1)).await,
        Err(TransmissionError::NotConnected(MachineId(2)))
    ));

    // Drain the peer side: every acknowledged send arrives, the timed-out one never does.
    let mut reader = FramedRead::new(peer, frame_codec());
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(Ok(frame)) = reader.next().await {
            match decode_frame(&frame).unwrap() {
                WireFrame::Clock(message) => received.push(message.clock),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(received, sent);
    assert!(!received.contains(&timed_out));
}
