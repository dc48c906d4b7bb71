use std::collections::VecDeque;

use crate::protocol::TransportMessage;

/// Outbound messages accepted while the link was down.
///
/// Unbounded; callers that need backpressure watch [`OutboundQueue::len`].
/// Drained strictly in insertion order on reconnect.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    queue: VecDeque<TransportMessage>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: TransportMessage) {
        self.queue.push_back(message);
    }

    /// Take everything queued, oldest first.
    pub fn drain(&mut self) -> Vec<TransportMessage> {
        self.queue.drain(..).collect()
    }

    /// Put back messages that could not be flushed, ahead of anything
    /// queued since.
    pub fn requeue_front(&mut self, messages: Vec<TransportMessage>) {
        for message in messages.into_iter().rev() {
            self.queue.push_front(message);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
