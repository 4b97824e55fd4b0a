//! Subscriber registry and fan-out.
//!
//! The registry is the only owner of subscriber callbacks. It opens the
//! connection when the first subscriber arrives and closes it when the last
//! one leaves. Set mutation and the resulting `open`/`close` happen under one
//! lock, so concurrent subscribe and unsubscribe calls cannot leave the
//! connection state out of step with the set.
//!
//! Fan-out works on a snapshot: a subscriber added while an update is being
//! delivered does not see that update. Unsubscribing clears a per-subscription
//! flag first, so a callback whose turn has not come yet is skipped.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::stream::client::{ConnectionController, ConnectionState, ControllerSettings};
use crate::stream::proto::StreamUpdate;
use crate::stream::sse::Transport;

type Callback = dyn Fn(&StreamUpdate) + Send + Sync + 'static;

/// Receiver of decoded updates.
pub trait UpdateSink: Send + Sync + 'static {
    fn fan_out(&self, update: StreamUpdate);
}

struct SubscriberSlot {
    id: u64,
    active: AtomicBool,
    callback: Box<Callback>,
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    slots: Vec<Arc<SubscriberSlot>>,
}

pub struct SubscriberRegistry {
    subscribers: Mutex<Subscribers>,
    controller: ConnectionController,
}

impl SubscriberRegistry {
    pub(crate) fn new(
        settings: ControllerSettings,
        transport: Arc<dyn Transport>,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new_cyclic(|registry| {
            let registry: Weak<Self> = Weak::clone(registry);
            let sink: Weak<dyn UpdateSink> = registry;
            Self {
                subscribers: Mutex::new(Subscribers::default()),
                controller: ConnectionController::new(settings, transport, runtime, sink),
            }
        })
    }

    pub fn controller(&self) -> &ConnectionController {
        &self.controller
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().slots.len()
    }

    /// Adds `callback` and opens the connection if nothing is serving it.
    ///
    /// The connection opens when this is the first subscriber, or when an
    /// earlier connection gave up after exhausting its reconnect attempts.
    pub fn subscribe<F>(self: &Arc<Self>, callback: F) -> Subscription
    where
        F: Fn(&StreamUpdate) + Send + Sync + 'static,
    {
        let mut subscribers = self.lock();
        let id = subscribers.next_id;
        subscribers.next_id += 1;

        let slot = Arc::new(SubscriberSlot {
            id,
            active: AtomicBool::new(true),
            callback: Box::new(callback),
        });
        subscribers.slots.push(Arc::clone(&slot));
        debug!(
            event = "subscriber_added",
            subscriber = id,
            subscribers = subscribers.slots.len()
        );

        if subscribers.slots.len() == 1 || self.controller.state() == ConnectionState::Closed {
            self.controller.open();
        }

        Subscription {
            registry: Arc::clone(self),
            slot,
        }
    }

    fn remove(&self, id: u64) {
        let mut subscribers = self.lock();
        let before = subscribers.slots.len();
        subscribers.slots.retain(|slot| slot.id != id);
        if subscribers.slots.len() == before {
            return;
        }
        debug!(
            event = "subscriber_removed",
            subscriber = id,
            subscribers = subscribers.slots.len()
        );

        if subscribers.slots.is_empty() {
            self.controller.close();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl UpdateSink for SubscriberRegistry {
    /// Delivers `update` to every subscriber in the current snapshot.
    ///
    /// A panicking callback is logged and skipped; it never stops delivery to
    /// the others and never unwinds out of this call.
    fn fan_out(&self, update: StreamUpdate) {
        let snapshot = self.lock().slots.clone();

        let mut delivered = 0usize;
        for slot in snapshot {
            if !slot.active.load(Ordering::Acquire) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| (slot.callback)(&update))) {
                Ok(()) => delivered += 1,
                Err(panic) => warn!(
                    event = "subscriber_panicked",
                    subscriber = slot.id,
                    panic = %panic_message(panic.as_ref())
                ),
            }
        }
        debug!(event = "stream_fan_out", kind = ?update.kind, delivered);
    }
}

impl Drop for SubscriberRegistry {
    fn drop(&mut self) {
        self.controller.close();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Membership of one callback in the registry.
///
/// Dropping the handle unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    registry: Arc<SubscriberRegistry>,
    slot: Arc<SubscriberSlot>,
}

impl Subscription {
    /// Removes this callback. Calls after the first are no-ops.
    pub fn unsubscribe(&self) {
        if self.slot.active.swap(false, Ordering::AcqRel) {
            self.registry.remove(self.slot.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.slot.active.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.slot.id)
            .field("active", &self.is_active())
            .finish()
    }
}
