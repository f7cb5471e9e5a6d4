//! Respawn scheduler.
//!
//! A delay queue of `(due, connection)` requests, earliest first, FIFO among
//! equal due times. Uniqueness per connection is checked when enqueueing; the
//! heap itself would happily hold duplicates.

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    time::Duration,
};

use session_shared::net::ConnectionId;

/// A pending respawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RespawnRequest {
    pub due: Duration,
    pub connection: ConnectionId,
    seq: u64,
}

impl Ord for RespawnRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for RespawnRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
pub struct RespawnScheduler {
    delay: Duration,
    queue: BinaryHeap<Reverse<RespawnRequest>>,
    next_seq: u64,
}

impl RespawnScheduler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            queue: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_queued(&self, connection: ConnectionId) -> bool {
        self.queue.iter().any(|r| r.0.connection == connection)
    }

    /// Schedules a respawn at `now + delay`. Returns false if one is already
    /// pending for this connection.
    pub fn enqueue(&mut self, now: Duration, connection: ConnectionId) -> bool {
        if self.is_queued(connection) {
            return false;
        }
        let req = RespawnRequest {
            due: now + self.delay,
            connection,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.queue.push(Reverse(req));
        true
    }

    /// Pops the earliest request if it is due. Only the head is examined, so
    /// several due requests drain one per call.
    pub fn pop_due(&mut self, now: Duration) -> Option<RespawnRequest> {
        match self.queue.peek() {
            Some(Reverse(head)) if head.due <= now => self.queue.pop().map(|r| r.0),
            _ => None,
        }
    }

    /// Drops the pending request for a connection, if any.
    pub fn purge(&mut self, connection: ConnectionId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|r| r.0.connection != connection);
        self.queue.len() != before
    }

    pub fn next_due(&self) -> Option<Duration> {
        self.queue.peek().map(|r| r.0.due)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
