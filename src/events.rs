//! Typed change events and a bounded queue for hosts that enqueue them.
//!
//! The storage layer can either call the `FeedSieve` hooks directly after
//! each committed mutation, or publish a `ChangeEvent` here and let
//! `FeedSieve::drain` apply them in order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::feed::{FeedId, Subscription};
use crate::filter::{FilterDefinition, FilterInstanceId};
use crate::post::PostId;

/// Default queue capacity.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1024;

/// A committed mutation the sieve must react to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// A post was created or its content changed.
    PostSaved { feed: FeedId, post: PostId },
    /// A post was deleted.
    PostDeleted { feed: FeedId, post: PostId },
    /// Filters were bound to or unbound from a feed, or its logic flipped.
    BindingChanged {
        feed: FeedId,
        added: Vec<FilterInstanceId>,
        removed: Vec<FilterInstanceId>,
        logic_changed: bool,
    },
    /// A filter definition was edited; carries the definition before the edit.
    DefinitionChanged { previous: FilterDefinition },
    /// A scope membership was created, moved or removed.
    SubscriptionChanged {
        current: Option<Subscription>,
        previous: Option<Subscription>,
    },
}

/// Producer half of the queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ChangePublisher {
    tx: Sender<ChangeEvent>,
    rejected: Arc<AtomicU64>,
}

impl ChangePublisher {
    /// Enqueues an event without blocking.
    ///
    /// # Errors
    ///
    /// Hands the event back if the queue is full or its consumer is gone.
    pub fn publish(&self, event: ChangeEvent) -> Result<(), ChangeEvent> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event) | TrySendError::Disconnected(event)) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(event)
            }
        }
    }

    /// Events handed back so far.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Consumer half of the queue.
#[derive(Debug)]
pub struct ChangeQueue {
    rx: Receiver<ChangeEvent>,
    publisher: ChangePublisher,
}

impl ChangeQueue {
    /// Creates a queue holding at most `capacity` events (min 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            rx,
            publisher: ChangePublisher {
                tx,
                rejected: Arc::new(AtomicU64::new(0)),
            },
        }
    }

    /// A publisher feeding this queue.
    #[must_use]
    pub fn publisher(&self) -> ChangePublisher {
        self.publisher.clone()
    }

    /// Number of queued events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Takes the next queued event, if any.
    #[must_use]
    pub fn try_next(&self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }
}

impl Default for ChangeQueue {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn saved() -> ChangeEvent {
        ChangeEvent::PostSaved {
            feed: FeedId::new(),
            post: PostId::new(),
        }
    }

    #[test]
    fn full_queue_hands_event_back() {
        let queue = ChangeQueue::new(1);
        let publisher = queue.publisher();
        publisher.publish(saved()).unwrap();

        let second = saved();
        assert_eq!(publisher.publish(second.clone()), Err(second));
        assert_eq!(publisher.rejected(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn events_come_out_in_order() {
        let queue = ChangeQueue::default();
        let publisher = queue.publisher();
        let first = saved();
        let second = ChangeEvent::SubscriptionChanged {
            current: None,
            previous: None,
        };
        publisher.publish(first.clone()).unwrap();
        publisher.publish(second.clone()).unwrap();

        assert_eq!(queue.try_next(), Some(first));
        assert_eq!(queue.try_next(), Some(second));
        assert!(queue.is_empty());
        assert_eq!(queue.try_next(), None);
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let json = serde_json::to_value(saved()).unwrap();
        assert_eq!(json["kind"], "post_saved");
    }
}
