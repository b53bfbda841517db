//! Inbound message queue.
//!
//! One queue per machine. Receiver tasks (one per peer connection) are the
//! only concurrent writers; the event loop is the only reader. Every access
//! goes through a single lock, so the pending count reported alongside a
//! dequeue is exactly the count at the instant of that dequeue.

use lamport_types::Message;
use parking_lot::Mutex;
use std::collections::VecDeque;
use thiserror::Error;

/// Capacity policy for a [`MessageQueue`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum pending messages. `None` means unbounded.
    ///
    /// When set, messages arriving while the queue is full are rejected.
    pub max_pending: Option<usize>,
}

impl QueueConfig {
    /// Unbounded queue (the default).
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Queue that rejects messages beyond `max_pending`.
    pub fn bounded(max_pending: usize) -> Self {
        Self {
            max_pending: Some(max_pending),
        }
    }
}

/// Errors from enqueueing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue full ({capacity} pending)")]
    Full { capacity: usize },
}

/// A message taken from the queue, with the count left behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dequeued {
    pub message: Message,
    /// Messages still pending immediately after this dequeue.
    pub remaining: usize,
}

/// Thread-safe FIFO of inbound messages.
#[derive(Debug, Default)]
pub struct MessageQueue {
    pending: Mutex<VecDeque<Message>>,
    max_pending: Option<usize>,
}

impl MessageQueue {
    /// Create a queue with the given capacity policy.
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            max_pending: config.max_pending,
        }
    }

    /// Create an unbounded queue.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Append a message. Returns the pending count after the append.
    pub fn enqueue(&self, message: Message) -> Result<usize, QueueError> {
        let mut pending = self.pending.lock();
        if let Some(capacity) = self.max_pending {
            if pending.len() >= capacity {
                return Err(QueueError::Full { capacity });
            }
        }
        pending.push_back(message);
        Ok(pending.len())
    }

    /// Take the oldest message, if any, without blocking.
    pub fn try_dequeue(&self) -> Option<Dequeued> {
        let mut pending = self.pending.lock();
        let message = pending.pop_front()?;
        Some(Dequeued {
            message,
            remaining: pending.len(),
        })
    }

    /// Current pending count.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lamport_types::MachineId;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn msg(sender: u32, clock: u64) -> Message {
        Message::new(MachineId(sender), clock)
    }

    #[test]
    fn test_fifo_order() {
        let queue = MessageQueue::unbounded();
        queue.enqueue(msg(1, 1)).unwrap();
        queue.enqueue(msg(1, 2)).unwrap();
        queue.enqueue(msg(2, 7)).unwrap();

        assert_eq!(queue.try_dequeue().unwrap().message.clock, 1);
        assert_eq!(queue.try_dequeue().unwrap().message.clock, 2);
        assert_eq!(queue.try_dequeue().unwrap().message.clock, 7);
        assert!(queue.try_dequeue().is_none());
    }

    #[test]
    fn test_remaining_counts_after_dequeue() {
        let queue = MessageQueue::unbounded();
        for i in 0..3 {
            queue.enqueue(msg(1, i)).unwrap();
        }
        assert_eq!(queue.try_dequeue().unwrap().remaining, 2);
        assert_eq!(queue.try_dequeue().unwrap().remaining, 1);
        assert_eq!(queue.try_dequeue().unwrap().remaining, 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_bounded_rejects_when_full() {
        let queue = MessageQueue::new(&QueueConfig::bounded(2));
        assert_eq!(queue.enqueue(msg(1, 1)), Ok(1));
        assert_eq!(queue.enqueue(msg(1, 2)), Ok(2));
        assert_eq!(
            queue.enqueue(msg(1, 3)),
            Err(QueueError::Full { capacity: 2 })
        );

        queue.try_dequeue().unwrap();
        assert_eq!(queue.enqueue(msg(1, 4)), Ok(2));
    }

    #[test]
    fn test_concurrent_producers_lose_nothing() {
        let queue = Arc::new(MessageQueue::unbounded());
        let producers: Vec<_> = (1..=4u32)
            .map(|sender| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for clock in 0..250 {
                        queue.enqueue(msg(sender, clock)).unwrap();
                    }
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut last_per_sender = [None::<u64>; 5];
        let mut done = false;
        while !done || !queue.is_empty() {
            done = producers.iter().all(|p| p.is_finished());
            while let Some(Dequeued { message, .. }) = queue.try_dequeue() {
                let slot = &mut last_per_sender[message.sender.get() as usize];
                // Per-sender order is preserved.
                assert!(slot.map_or(true, |prev| prev < message.clock));
                *slot = Some(message.clock);
                assert!(seen.insert((message.sender, message.clock)));
            }
        }
        for p in producers {
            p.join().unwrap();
        }
        while let Some(Dequeued { message, .. }) = queue.try_dequeue() {
            assert!(seen.insert((message.sender, message.clock)));
        }
        assert_eq!(seen.len(), 1000);
    }
}
