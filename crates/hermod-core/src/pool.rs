//! A bounded, process-wide free list of [`Message`] values.
//!
//! The reuse pattern is a deliberate allocation optimization (spec.md §9);
//! a correct implementation could equally hand out fresh `Message` values
//! per read. The contract every consumer must honor either way: never
//! retain a reference past [`crate::Sink::write_batch`] returning, and
//! release exactly once per acquire, after Ack or permanent failure
//! (invariant 5).

use crossbeam_queue::ArrayQueue;

use crate::message::Message;

/// Construct one `MessagePool` per engine instance and share it (via
/// `Arc<MessagePool>`) with every source and sink it wires together —
/// deliberately not a `static`, so tests and multiple engines in one process
/// never cross-contaminate pools (spec.md §9: "avoid global singletons;
/// scope to the owning component").
pub struct MessagePool {
    free: ArrayQueue<Message>,
}

impl MessagePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Acquire a `Message`, reusing a released instance if one is free or
    /// allocating a fresh, zeroed one otherwise.
    pub fn acquire(&self) -> Message {
        self.free.pop().unwrap_or_default()
    }

    /// Return a `Message` to the pool after it has been Acked or has
    /// permanently failed. Zeroes the message before making it available for
    /// reuse. If the pool is at capacity the message is simply dropped.
    pub fn release(&self, mut msg: Message) {
        msg.reset();
        let _ = self.free.push(msg);
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }
}

impl std::fmt::Debug for MessagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePool")
            .field("free_len", &self.free.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Operation;

    #[test]
    fn pool_discipline_reuses_and_resets() {
        let pool = MessagePool::new(4);
        let mut msg = pool.acquire();
        msg.set_id("abc").set_operation(Operation::Update);
        assert_eq!(msg.id(), "abc");
        pool.release(msg);
        assert_eq!(pool.len(), 1);

        let reused = pool.acquire();
        assert_eq!(reused.id(), "");
        assert_eq!(reused.operation(), Operation::Create);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn pool_drops_beyond_capacity() {
        let pool = MessagePool::new(1);
        pool.release(pool.acquire());
        pool.release(pool.acquire());
        assert_eq!(pool.len(), 1);
    }
}
