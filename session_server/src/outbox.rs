//! Outgoing message queue.
//!
//! Session logic never touches sockets: it queues messages here during a tick
//! and the IO layer flushes them afterwards. Per-peer order is preserved.

use session_shared::net::{Channel, ConnectionId, NetMsg};

/// One queued message.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub to: ConnectionId,
    pub channel: Channel,
    pub msg: NetMsg,
}

#[derive(Debug, Default)]
pub struct Outbox {
    queue: Vec<Outgoing>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, to: ConnectionId, channel: Channel, msg: NetMsg) {
        self.queue.push(Outgoing { to, channel, msg });
    }

    pub fn reliable(&mut self, to: ConnectionId, msg: NetMsg) {
        self.send(to, Channel::Reliable, msg);
    }

    pub fn unreliable(&mut self, to: ConnectionId, msg: NetMsg) {
        self.send(to, Channel::Unreliable, msg);
    }

    /// Queues a reliable copy of `msg` for every listed peer.
    pub fn broadcast_reliable(&mut self, to: impl IntoIterator<Item = ConnectionId>, msg: &NetMsg) {
        for id in to {
            self.reliable(id, msg.clone());
        }
    }

    pub fn drain(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.queue)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Outgoing> {
        self.queue.iter()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
