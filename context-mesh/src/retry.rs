//! Bounded queue of messages awaiting a durable write.

use crate::types::ContextMessage;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

/// FIFO retry queue that evicts the oldest entry when full.
pub(crate) struct RetryQueue {
    capacity: usize,
    queue: Mutex<VecDeque<ContextMessage>>,
}

impl RetryQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append a message, returning the evicted one if the queue was full.
    pub fn push(&self, message: ContextMessage) -> Option<ContextMessage> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let evicted = if queue.len() >= self.capacity {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(message);
        evicted
    }

    /// Put failed messages back ahead of anything queued since the drain.
    /// Returns whatever no longer fits, oldest first.
    pub fn requeue_front(&self, failed: Vec<ContextMessage>) -> Vec<ContextMessage> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        for message in failed.into_iter().rev() {
            queue.push_front(message);
        }
        let overflow = queue.len().saturating_sub(self.capacity);
        queue.drain(..overflow).collect()
    }

    /// Take everything currently queued.
    pub fn take_all(&self) -> Vec<ContextMessage> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_store::ContextType;

    fn message(n: u64) -> ContextMessage {
        ContextMessage::new("tide", ContextType::Telemetry).with_field("n", n)
    }

    fn numbers(messages: &[ContextMessage]) -> Vec<u64> {
        messages
            .iter()
            .filter_map(|m| m.field("n").and_then(|v| v.as_u64()))
            .collect()
    }

    #[test]
    fn test_push_evicts_oldest() {
        let queue = RetryQueue::new(2);
        assert!(queue.push(message(1)).is_none());
        assert!(queue.push(message(2)).is_none());

        let evicted = queue.push(message(3)).unwrap();
        assert_eq!(evicted.field("n"), Some(&serde_json::json!(1)));
        assert_eq!(numbers(&queue.take_all()), vec![2, 3]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_requeue_keeps_failed_ahead() {
        let queue = RetryQueue::new(3);
        queue.push(message(1));
        queue.push(message(2));
        let failed = queue.take_all();

        queue.push(message(3));
        queue.push(message(4));
        let overflow = queue.requeue_front(failed);

        assert_eq!(numbers(&overflow), vec![1]);
        assert_eq!(numbers(&queue.take_all()), vec![2, 3, 4]);
    }
}
