//! Subscriber registry
//!
//! Fan-out of [`MailUpdate`]s to a dynamic set of bounded channels.
//!
//! Delivery policy: `broadcast` never waits on a subscriber. Each send is
//! a `try_send`; when a subscriber's buffer is full the update is dropped
//! for that subscriber alone and its drop counter is bumped. Subscribers
//! whose receiving half is gone are pruned on the next broadcast.
//!
//! The map lock is held across the whole broadcast, so an unsubscribe
//! either happens entirely before a broadcast (the subscriber misses it)
//! or entirely after (the subscriber got it). There is no window where
//! a half-removed subscriber is still being sent to.

use crate::update::MailUpdate;
use futures::Stream;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Opaque handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Slot {
    sender: mpsc::Sender<MailUpdate>,
    dropped: Arc<AtomicU64>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    closed: bool,
    slots: HashMap<SubscriberId, Slot>,
}

/// Concurrency-safe set of subscriber channels.
pub struct SubscriberRegistry {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl SubscriberRegistry {
    /// `capacity` is the per-subscriber buffer; values below 1 are
    /// raised to 1.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Register a new subscriber. It sees only updates broadcast after
    /// this call returns.
    ///
    /// On a closed registry the returned subscription is already ended.
    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let dropped = Arc::new(AtomicU64::new(0));

        let mut inner = self.lock();
        let id = SubscriberId(inner.next_id);
        inner.next_id += 1;

        if inner.closed {
            drop(sender);
        } else {
            inner.slots.insert(
                id,
                Slot {
                    sender,
                    dropped: Arc::clone(&dropped),
                },
            );
            debug!("Subscriber {} registered ({} active)", id, inner.slots.len());
        }

        Subscription {
            id,
            receiver,
            dropped,
        }
    }

    /// Remove a subscriber and close its channel. Unknown or already
    /// removed ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.lock().slots.remove(&id).is_some();
        if removed {
            debug!("Subscriber {} removed", id);
        }
        removed
    }

    /// Offer `update` to every registered subscriber without blocking.
    ///
    /// Returns how many subscribers accepted it.
    pub fn broadcast(&self, update: &MailUpdate) -> usize {
        let mut inner = self.lock();
        let mut delivered = 0;
        let mut gone = Vec::new();

        for (id, slot) in &inner.slots {
            match slot.sender.try_send(update.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    let total = slot.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        "Subscriber {} is full, dropped UID {} ({} dropped so far)",
                        id, update.uid, total
                    );
                }
                Err(TrySendError::Closed(_)) => gone.push(*id),
            }
        }

        for id in gone {
            inner.slots.remove(&id);
            debug!("Subscriber {} went away, pruned", id);
        }
        delivered
    }

    /// Close every channel and refuse new subscribers.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        let count = inner.slots.len();
        inner.slots.clear();
        debug!("Registry closed, {} subscriber(s) released", count);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Poisoning only means another thread panicked mid-mutation of a
    // plain map; the map itself is still consistent.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Receiving end of one subscription.
///
/// Yields updates in broadcast order and ends once the subscriber is
/// removed or the client is closed. Also usable as a [`Stream`].
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<MailUpdate>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Handle to pass to `unsubscribe`.
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next update; `None` once the subscription ended and
    /// its buffer is drained.
    pub async fn recv(&mut self) -> Option<MailUpdate> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<MailUpdate> {
        self.receiver.try_recv().ok()
    }

    /// Updates dropped because this subscriber's buffer was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

impl Stream for Subscription {
    type Item = MailUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
