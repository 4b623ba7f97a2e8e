//! Types published to / consumed from the notification bus (spec §6).
//! Index-change notifications originate inside this crate, so
//! [`IndexChangeBus`] is the one broadcast wrapper it owns and publishes
//! into. Document-change notifications originate in the host's document
//! store, outside this crate's boundary (§1 Non-goals); an `Index`
//! consumes them through [`crate::index::Index::handle_document_change`]
//! rather than owning a subscription of its own.

use async_broadcast::{
    broadcast,
    Receiver,
    Sender,
};

use crate::etag::CollectionName;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexChangeKind {
    BatchCompleted,
    IndexDemotedToIdle,
    IndexDemotedToDisabled,
    IndexPromotedFromIdle,
    IndexMarkedAsErrored,
}

#[derive(Debug, Clone)]
pub struct IndexChangeNotification {
    pub index_name: String,
    pub kind: IndexChangeKind,
}

#[derive(Debug, Clone)]
pub struct DocumentChangeNotification {
    pub collection: CollectionName,
}

/// A small broadcast bus for index-change notifications. The host process
/// owns one of these; every index subscribes to it and publishes to it.
#[derive(Clone)]
pub struct IndexChangeBus {
    sender: Sender<IndexChangeNotification>,
}

impl IndexChangeBus {
    pub fn new(capacity: usize) -> (Self, Receiver<IndexChangeNotification>) {
        let (mut sender, receiver) = broadcast(capacity);
        // Overflow drops the oldest unread notification rather than
        // blocking the publisher; indexes only care about the latest
        // state transition, not every historical one.
        sender.set_overflow(true);
        (Self { sender }, receiver)
    }

    pub fn publish(&self, notification: IndexChangeNotification) {
        // A full/closed bus is not fatal to the publisher: a dropped
        // notification just means a waiting query wakes up late, not
        // never (the wake-event and batch-completed event are the real
        // source of truth for correctness).
        let _ = self.sender.try_broadcast(notification);
    }

    pub fn subscribe(&self) -> Receiver<IndexChangeNotification> {
        self.sender.new_receiver()
    }
}
