//! Pending-write queue for bytes that arrive before the target is connected

use std::collections::VecDeque;

use bytes::Bytes;

/// Returned when a push would take the queue past its byte cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull {
    pub queued: usize,
    pub limit: usize,
}

impl std::fmt::Display for QueueFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pending queue full ({} bytes queued, limit {})",
            self.queued, self.limit
        )
    }
}

impl std::error::Error for QueueFull {}

/// FIFO of client chunks, drained exactly once when the target connects
#[derive(Debug)]
pub struct PendingQueue {
    chunks: VecDeque<Bytes>,
    bytes: usize,
    limit: usize,
}

impl PendingQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            limit,
        }
    }

    /// Append a chunk behind everything already queued.
    ///
    /// Empty chunks are ignored. A chunk that would exceed the limit is
    /// rejected and the queue is left unchanged.
    pub fn push(&mut self, chunk: Bytes) -> Result<(), QueueFull> {
        if chunk.is_empty() {
            return Ok(());
        }

        let queued = self.bytes + chunk.len();
        if queued > self.limit {
            return Err(QueueFull {
                queued,
                limit: self.limit,
            });
        }

        self.bytes = queued;
        self.chunks.push_back(chunk);
        Ok(())
    }

    /// Take every queued chunk in arrival order, leaving the queue empty
    pub fn drain(&mut self) -> impl Iterator<Item = Bytes> + '_ {
        self.bytes = 0;
        self.chunks.drain(..)
    }

    /// Drop everything queued
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.bytes = 0;
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_preserves_arrival_order() {
        let mut queue = PendingQueue::new(1024);
        queue.push(Bytes::from_static(b"PI")).unwrap();
        queue.push(Bytes::from_static(b"NG")).unwrap();
        queue.push(Bytes::from_static(b"\n")).unwrap();

        assert_eq!(queue.len_bytes(), 5);
        assert_eq!(queue.chunk_count(), 3);

        let flushed: Vec<u8> = queue.drain().flat_map(|c| c.to_vec()).collect();
        assert_eq!(flushed, b"PING\n");
        assert!(queue.is_empty());
        assert_eq!(queue.len_bytes(), 0);
    }

    #[test]
    fn test_limit_rejects_without_mutation() {
        let mut queue = PendingQueue::new(8);
        queue.push(Bytes::from_static(b"12345")).unwrap();

        let err = queue.push(Bytes::from_static(b"6789")).unwrap_err();
        assert_eq!(err, QueueFull { queued: 9, limit: 8 });
        assert_eq!(queue.len_bytes(), 5);
        assert_eq!(queue.chunk_count(), 1);

        // Exactly at the limit is fine
        queue.push(Bytes::from_static(b"678")).unwrap();
        assert_eq!(queue.len_bytes(), 8);
    }

    #[test]
    fn test_empty_chunks_are_ignored() {
        let mut queue = PendingQueue::new(4);
        queue.push(Bytes::new()).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut queue = PendingQueue::new(16);
        queue.push(Bytes::from_static(b"data")).unwrap();
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.len_bytes(), 0);
    }
}
