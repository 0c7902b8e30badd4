//! Change notifications published by banks, browsers and the registry.
//!
//! Observers subscribe to an [`EventBus`] and receive [`BankEvent`]s over a
//! channel, so they are never run on the publisher's thread.

use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::tags::TagId;

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub u64);

impl SubscriberId {
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        SubscriberId(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// Events emitted by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BankEvent {
    /// A browser moved onto another picture.
    PictureChanged { picture_id: String, browser_id: u64 },
    /// Ingestion of a picture succeeded.
    PictureAdded { bank_id: u32, picture_id: String },
    /// A tag was created, edited or removed.
    TagChanged { bank_id: u32, tag_id: TagId },
    /// Bank selection or membership changed.
    BankListChanged,
}

/// Observer list for [`BankEvent`]s.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<(SubscriberId, mpsc::Sender<BankEvent>)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<(SubscriberId, mpsc::Sender<BankEvent>)>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new observer.
    /// Returns its id and the receiving end of its channel.
    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<BankEvent>) {
        let (tx, rx) = mpsc::channel();
        let id = self.subscribe_sender(tx);
        (id, rx)
    }

    /// Register an existing sender, e.g. one shared across several buses.
    pub fn subscribe_sender(&self, sender: mpsc::Sender<BankEvent>) -> SubscriberId {
        let id = SubscriberId::new();
        self.subscribers().push((id, sender));
        id
    }

    /// Returns true if the observer was registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers();
        let before = subscribers.len();
        subscribers.retain(|(sub, _)| *sub != id);
        subscribers.len() != before
    }

    /// Deliver an event to every observer. Observers whose receiver was
    /// dropped are forgotten.
    pub fn publish(&self, event: BankEvent) {
        let mut subscribers = self.subscribers();
        subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::new();
        let (_, rx1) = bus.subscribe();
        let (_, rx2) = bus.subscribe();

        bus.publish(BankEvent::BankListChanged);

        assert_eq!(rx1.try_recv().unwrap(), BankEvent::BankListChanged);
        assert_eq!(rx2.try_recv().unwrap(), BankEvent::BankListChanged);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (id, rx) = bus.subscribe();

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        bus.publish(BankEvent::BankListChanged);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receivers_are_pruned() {
        let bus = EventBus::new();
        let (_, rx) = bus.subscribe();
        drop(rx);
        let (_, _kept) = bus.subscribe();

        bus.publish(BankEvent::TagChanged { bank_id: 1, tag_id: 3 });
        assert_eq!(bus.subscriber_count(), 1);
    }
}
