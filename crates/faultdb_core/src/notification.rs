//! Save notifications.
//!
//! Every successful save emits one [`SaveNotification`] naming the objects it
//! inserted, updated and deleted. Other contexts receive it through a
//! subscription channel and fold it in with `Context::merge_external_save`.
//!
//! # Usage
//!
//! ```rust,ignore
//! let notifications = coordinator.subscribe();
//!
//! writer.save()?;
//!
//! while let Ok(note) = notifications.try_recv() {
//!     reader.merge_external_save(&note)?;
//! }
//! ```

use crate::identifier::ObjectId;
use crate::types::{ContextId, SequenceNumber};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::mpsc::{self, Receiver, Sender};

/// The identifiers touched by one committed save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveNotification {
    /// Commit sequence of the save.
    pub sequence: SequenceNumber,
    /// Context that saved.
    pub source: ContextId,
    /// Commit time, milliseconds since the epoch.
    pub timestamp: i64,
    /// Newly inserted objects, with permanent identifiers.
    pub inserted: BTreeSet<ObjectId>,
    /// Updated objects.
    pub updated: BTreeSet<ObjectId>,
    /// Deleted objects.
    pub deleted: BTreeSet<ObjectId>,
}

impl SaveNotification {
    /// Returns true if the save touched nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Every identifier in the notification.
    pub fn all_ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.inserted
            .iter()
            .chain(&self.updated)
            .chain(&self.deleted)
    }
}

/// Distributes save notifications to subscribers.
///
/// Notifications are delivered in commit order and also kept in a bounded
/// history for catch-up polling.
#[derive(Debug)]
pub struct NotificationCenter {
    subscribers: RwLock<Vec<Sender<SaveNotification>>>,
    history: RwLock<Vec<SaveNotification>>,
    max_history: usize,
}

impl NotificationCenter {
    /// Creates a center keeping the last `max_history` notifications.
    #[must_use]
    pub fn new(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            max_history,
        }
    }

    /// Subscribes to all future notifications.
    ///
    /// The receiver should be drained regularly; undelivered notifications
    /// queue up without bound.
    pub fn subscribe(&self) -> Receiver<SaveNotification> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Records and broadcasts a notification.
    ///
    /// Called synchronously at the end of a successful save. Disconnected
    /// subscribers are dropped.
    pub fn emit(&self, notification: SaveNotification) {
        {
            let mut history = self.history.write();
            history.push(notification.clone());
            if history.len() > self.max_history {
                let excess = history.len() - self.max_history;
                history.drain(0..excess);
            }
        }

        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
    }

    /// Notifications with sequence greater than `cursor`, up to `limit`.
    #[must_use]
    pub fn poll(&self, cursor: SequenceNumber, limit: usize) -> Vec<SaveNotification> {
        self.history
            .read()
            .iter()
            .filter(|n| n.sequence > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Sequence of the newest notification in history.
    #[must_use]
    pub fn latest_sequence(&self) -> SequenceNumber {
        self.history
            .read()
            .last()
            .map_or(SequenceNumber::default(), |n| n.sequence)
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}
