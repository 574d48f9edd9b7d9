//! Ring Buffer (spec.md §2 component table, 2% share): the bounded
//! producer/consumer queue between the source reader task and the writer
//! task.
//!
//! Implemented over `tokio::sync::mpsc` rather than a hand-rolled ring —
//! the teacher's CLI wires its source/sink tasks together the same way
//! (`bins/rde-cli`'s `mpsc::channel(args.channel_capacity)`). The type
//! alias below exists so the rest of this crate names the concept ("ring
//! buffer") the spec uses rather than a bare channel, and so its capacity
//! is threaded through one constructor rather than scattered literal
//! `mpsc::channel` calls.

use hermod_core::Message;
use tokio::sync::mpsc;

/// The producer half, held by the reader task.
pub struct RingSender(mpsc::Sender<Message>);

/// The consumer half, held by the writer task.
pub struct RingReceiver(mpsc::Receiver<Message>);

/// Construct a bounded ring buffer of the given capacity (spec.md §4.10's
/// `EngineConfig::ring_buffer_capacity`).
pub fn channel(capacity: usize) -> (RingSender, RingReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (RingSender(tx), RingReceiver(rx))
}

impl RingSender {
    /// Push a message, waiting for free capacity if the buffer is full.
    /// Returns an error only once the receiver (writer task) has been
    /// dropped, signalling engine shutdown.
    pub async fn push(&self, msg: Message) -> Result<(), Message> {
        self.0.send(msg).await.map_err(|e| e.0)
    }
}

impl RingReceiver {
    pub async fn pop(&mut self) -> Option<Message> {
        self.0.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hermod_core::Operation;

    #[tokio::test]
    async fn pushes_and_pops_in_order() {
        let (tx, mut rx) = channel(4);
        for i in 0..3 {
            let mut msg = Message::default();
            msg.set_id(i.to_string()).set_operation(Operation::Create);
            tx.push(msg).await.unwrap();
        }
        for i in 0..3 {
            let msg = rx.pop().await.unwrap();
            assert_eq!(msg.id(), i.to_string());
        }
    }

    #[tokio::test]
    async fn push_errors_once_receiver_dropped() {
        let (tx, rx) = channel(1);
        drop(rx);
        let mut msg = Message::default();
        msg.set_id("x");
        assert!(tx.push(msg).await.is_err());
    }
}
