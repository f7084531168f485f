//! Hand-off between the edge callback and the consumer thread.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::frame::Transaction;

const INITIAL_CAPACITY: usize = 64;

/// Lock a mutex, carrying on with the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// FIFO of completed transactions behind a single mutex.
///
/// The producer holds the lock only to push one transaction; the consumer
/// swaps the whole queue out and processes it after unlocking. Growth is
/// bounded by how far the consumer falls behind.
#[derive(Debug, Clone)]
pub struct TransactionQueue {
    inner: Arc<Mutex<VecDeque<Transaction>>>,
}

impl TransactionQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(INITIAL_CAPACITY))),
        }
    }

    pub fn push(&self, transaction: Transaction) {
        lock(&self.inner).push_back(transaction);
    }

    /// Move everything queued into `local`, keeping order.
    ///
    /// When `local` is empty the two buffers are swapped, so neither side
    /// reallocates.
    pub fn drain_into(&self, local: &mut VecDeque<Transaction>) {
        let mut queued = lock(&self.inner);
        if local.is_empty() {
            std::mem::swap(&mut *queued, local);
        } else {
            local.extend(queued.drain(..));
        }
    }

    /// Take everything queued, oldest first.
    pub fn drain(&self) -> Vec<Transaction> {
        lock(&self.inner).drain(..).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }
}

impl Default for TransactionQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(number: u32) -> Transaction {
        Transaction {
            number,
            ..Transaction::default()
        }
    }

    #[test]
    fn test_drain_keeps_publication_order() {
        let queue = TransactionQueue::new();
        for number in 0..5 {
            queue.push(numbered(number));
        }

        let drained: Vec<u32> = queue.drain().iter().map(Transaction::number).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_into_appends_behind_leftovers() {
        let queue = TransactionQueue::new();
        let mut local = VecDeque::new();
        local.push_back(numbered(1));

        queue.push(numbered(2));
        queue.push(numbered(3));
        queue.drain_into(&mut local);

        let numbers: Vec<u32> = local.iter().map(Transaction::number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_clones_share_one_queue() {
        let producer = TransactionQueue::new();
        let consumer = producer.clone();

        producer.push(numbered(7));
        assert_eq!(consumer.len(), 1);
        assert_eq!(consumer.drain()[0].number(), 7);
    }
}
