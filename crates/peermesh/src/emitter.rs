//! Typed event fan-out
//!
//! Each component exposes a closed set of event variants through an
//! `Emitter`. Subscribers get an unbounded receiver; emission pushes to all
//! live subscribers in registration order and prunes the dead ones.

use tokio::sync::mpsc;

pub struct Emitter<E> {
    subscribers: std::sync::Mutex<Vec<mpsc::UnboundedSender<E>>>,
}

impl<E: Clone> Emitter<E> {
    pub fn new() -> Self {
        Self {
            subscribers: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber, in registration order.
    pub fn emit(&self, event: E) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

impl<E: Clone> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_all_subscribers_in_order() {
        let emitter = Emitter::new();
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        emitter.emit(1u32);
        emitter.emit(2u32);

        assert_eq!(rx1.recv().await, Some(1));
        assert_eq!(rx1.recv().await, Some(2));
        assert_eq!(rx2.recv().await, Some(1));
        assert_eq!(rx2.recv().await, Some(2));
    }

    #[tokio::test]
    async fn prunes_dropped_subscribers() {
        let emitter = Emitter::new();
        let rx = emitter.subscribe();
        let _rx2 = emitter.subscribe();
        assert_eq!(emitter.subscriber_count(), 2);

        drop(rx);
        emitter.emit(7u32);
        assert_eq!(emitter.subscriber_count(), 1);
    }
}
