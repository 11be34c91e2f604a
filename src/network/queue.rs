//! Outbound datagram queue

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};

/// Unbounded FIFO of ready-to-send datagrams.
///
/// Producers enqueue from any thread; only the send loop dequeues.
#[derive(Clone)]
pub struct SendQueue {
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
}

impl SendQueue {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    /// Append a datagram; never blocks
    pub fn enqueue(&self, datagram: Bytes) {
        // Cannot fail: the queue owns a receiver for as long as it owns the sender
        let _ = self.tx.send(datagram);
    }

    pub fn try_dequeue(&self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Drop everything queued, returning how many datagrams were discarded
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = SendQueue::new();
        for i in 0..5u8 {
            queue.enqueue(Bytes::from(vec![i]));
        }

        assert_eq!(queue.len(), 5);
        let drained: Vec<u8> = std::iter::from_fn(|| queue.try_dequeue())
            .map(|b| b[0])
            .collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear() {
        let queue = SendQueue::new();
        let producer = queue.clone();
        producer.enqueue(Bytes::from_static(b"a"));
        producer.enqueue(Bytes::from_static(b"b"));

        assert_eq!(queue.clear(), 2);
        assert!(queue.try_dequeue().is_none());
    }

    #[test]
    fn test_concurrent_producers() {
        let queue = SendQueue::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let q = queue.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        q.enqueue(Bytes::from_static(b"x"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(queue.len(), 400);
    }
}
