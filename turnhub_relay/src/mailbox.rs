// Bounded store-and-forward queue for one recipient.
//
// The hub parks messages here while their recipient is registered but not
// connected, and drains them in arrival order on reconnect. Arrival order is
// the hub's processing order, so per-sender FIFO is preserved. When full, the
// oldest message is evicted and returned to the caller, which logs it.

use std::collections::VecDeque;

use turnhub_protocol::types::ParticipantId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub from: ParticipantId,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub struct Mailbox {
    queue: VecDeque<QueuedMessage>,
    capacity: usize,
    dropped: u64,
}

impl Mailbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Append a message. Returns the evicted oldest message on overflow.
    pub fn push(&mut self, msg: QueuedMessage) -> Option<QueuedMessage> {
        let evicted = if self.queue.len() >= self.capacity {
            self.dropped += 1;
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(msg);
        evicted
    }

    pub fn drain(&mut self) -> impl Iterator<Item = QueuedMessage> + '_ {
        self.queue.drain(..)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Total messages evicted over this mailbox's life.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
