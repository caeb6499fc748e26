//! Notification Router
//!
//! Holds at most one subscriber per [`NotificationKind`]. A subscriber is
//! either an inline handler, run on whichever task calls [`NotificationRouter::route`],
//! or a queue whose receiver is drained on the subscriber's own task.
//!
//! A [`SlotLease`] takes a slot over for a while (one query, one upload) and
//! hands it back to the displaced subscriber when it ends.

use crate::domain::models::{Notification, NotificationKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;
use tracing::{debug, trace};

pub type Handler = Arc<dyn Fn(&Notification) + Send + Sync>;

#[derive(Clone)]
enum Subscriber {
    Inline(Handler),
    Queued(mpsc::UnboundedSender<Notification>),
    Leased {
        id: u64,
        tx: mpsc::UnboundedSender<Notification>,
        displaced: Option<Box<Subscriber>>,
    },
}

type Slots = HashMap<NotificationKind, Subscriber>;

#[derive(Default)]
pub struct NotificationRouter {
    slots: Mutex<Slots>,
    next_lease: AtomicU64,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install `handler` for `kind`, replacing any previous subscriber
    pub fn register<F>(&self, kind: NotificationKind, handler: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.install(kind, Subscriber::Inline(Arc::new(handler)));
    }

    /// Install a queue for `kind`, replacing any previous subscriber
    ///
    /// A replaced queue sees its receiver close.
    pub fn subscribe(&self, kind: NotificationKind) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.install(kind, Subscriber::Queued(tx));
        rx
    }

    fn install(&self, kind: NotificationKind, subscriber: Subscriber) {
        if self.slots().insert(kind, subscriber).is_some() {
            debug!("Replaced {:?} subscriber", kind);
        }
    }

    /// Take the slot for `kind` until the returned lease is dropped
    ///
    /// The subscriber in place now gets the slot back afterwards. Leasing a
    /// slot that is already leased closes the earlier lease's receiver and
    /// keeps the original subscriber for restoring. Registering, subscribing
    /// or unregistering while leased discards the displaced subscriber.
    pub fn lease(
        self: &Arc<Self>,
        kind: NotificationKind,
    ) -> (mpsc::UnboundedReceiver<Notification>, SlotLease) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        let mut slots = self.slots();
        let displaced = match slots.remove(&kind) {
            Some(Subscriber::Leased { displaced, .. }) => displaced,
            other => other.map(Box::new),
        };
        slots.insert(kind, Subscriber::Leased { id, tx, displaced });

        let lease = SlotLease {
            router: self.clone(),
            kind,
            id,
        };
        (rx, lease)
    }

    pub fn unregister(&self, kind: NotificationKind) {
        self.slots().remove(&kind);
    }

    pub fn is_subscribed(&self, kind: NotificationKind) -> bool {
        self.slots().contains_key(&kind)
    }

    /// Deliver to the subscriber for the notification's kind, if any
    ///
    /// Returns `true` if a subscriber took the notification.
    pub fn route(&self, notification: Notification) -> bool {
        let kind = notification.kind();
        // Clone the sender or handler out so handlers may re-enter the router
        let subscriber = match self.slots().get(&kind) {
            None => None,
            Some(Subscriber::Inline(handler)) => Some(Subscriber::Inline(handler.clone())),
            Some(Subscriber::Queued(tx)) | Some(Subscriber::Leased { tx, .. }) => {
                Some(Subscriber::Queued(tx.clone()))
            }
        };

        match subscriber {
            None => {
                trace!("No subscriber for {:?}, dropped", kind);
                false
            }
            Some(Subscriber::Inline(handler)) => {
                handler(&notification);
                true
            }
            Some(Subscriber::Queued(tx)) | Some(Subscriber::Leased { tx, .. }) => {
                let Err(SendError(notification)) = tx.send(notification) else {
                    return true;
                };
                let restored = {
                    let mut slots = self.slots();
                    // Only touch the slot if it still holds the dead queue
                    let dead = match slots.get(&kind) {
                        Some(Subscriber::Queued(current)) if current.same_channel(&tx) => {
                            Some(false)
                        }
                        Some(Subscriber::Leased { tx: current, .. })
                            if current.same_channel(&tx) =>
                        {
                            Some(true)
                        }
                        _ => None,
                    };
                    match dead {
                        Some(false) => {
                            slots.remove(&kind);
                            debug!("Removed closed {:?} subscriber", kind);
                            false
                        }
                        Some(true) => {
                            release(&mut slots, kind);
                            true
                        }
                        None => false,
                    }
                };
                // A lease that ended early hands this notification on too
                restored && self.route(notification)
            }
        }
    }
}

/// Hand a leased slot back to the subscriber it displaced
fn release(slots: &mut Slots, kind: NotificationKind) {
    if let Some(Subscriber::Leased {
        displaced: Some(previous),
        ..
    }) = slots.remove(&kind)
    {
        slots.insert(kind, *previous);
        debug!("Restored {:?} subscriber", kind);
    }
}

/// Temporary ownership of one subscriber slot, see [`NotificationRouter::lease`]
pub struct SlotLease {
    router: Arc<NotificationRouter>,
    kind: NotificationKind,
    id: u64,
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        let mut slots = self.router.slots();
        let current = matches!(
            slots.get(&self.kind),
            Some(Subscriber::Leased { id, .. }) if *id == self.id
        );
        if current {
            release(&mut slots, self.kind);
        }
    }
}
