//! Lifecycle events and the `EventBus` that delivers them.
//!
//! Subscribers are called synchronously, in subscription order, on whatever
//! task emits the event. Control tokens never show up here.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::error::LinkError;
use crate::gate::RejectReason;
use crate::tracker::ConnectionId;

/// Events published by a hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    /// Upgrade accepted and connection registered.
    Connected {
        id: ConnectionId,
        remote_address: Option<String>,
    },
    /// Application payload from a member.
    Message { id: ConnectionId, text: String },
    /// Connection closed and unregistered.
    Disconnected {
        id: ConnectionId,
        code: Option<u16>,
        reason: String,
    },
    /// Forced close after too many missed heartbeats.
    Evicted { id: ConnectionId, strikes: u32 },
    /// Upgrade refused with 403.
    Rejected {
        remote_address: Option<String>,
        reason: RejectReason,
    },
}

/// Events published by a member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEvent {
    Open,
    /// Application payload from the hub.
    Message(String),
    Close { code: Option<u16>, reason: String },
    Error(LinkError),
    /// A retry was scheduled after a close.
    Reconnecting { attempt: u32, delay_ms: u64 },
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Hold this value to keep receiving events, drop it to unsubscribe.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription<E> {
    bus: Weak<EventBus<E>>,
    id: usize,
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus for publishing lifecycle events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus<E> {
    callbacks: RwLock<Vec<(usize, Callback<E>)>>,
    next_id: AtomicUsize,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&E) + Send + Sync + 'static,
    ) -> Subscription<E> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // emit releases its read guard before running callbacks, so a
        // Subscription dropped inside a callback cannot deadlock here
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: E) {
        // Clone the list so a callback may subscribe without deadlocking
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_delivery_in_subscription_order() {
        let bus = Arc::new(EventBus::<MemberEvent>::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let first_log = Arc::clone(&log);
        let _first = bus.subscribe(move |_| first_log.lock().unwrap().push("first"));
        let second_log = Arc::clone(&log);
        let _second = bus.subscribe(move |_| second_log.lock().unwrap().push("second"));

        bus.emit(MemberEvent::Open);

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = Arc::new(EventBus::<MemberEvent>::new());
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let sub = bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(MemberEvent::Open);
        drop(sub);
        bus.emit(MemberEvent::Open);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_callback_sees_payload() {
        let bus = Arc::new(EventBus::<HubEvent>::new());
        let seen = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&seen);
        let _sub = bus.subscribe(move |event| {
            if let HubEvent::Message { text, .. } = event {
                *slot.lock().unwrap() = Some(text.clone());
            }
        });

        bus.emit(HubEvent::Message {
            id: ConnectionId::generate(),
            text: "hello".into(),
        });

        assert_eq!(seen.lock().unwrap().as_deref(), Some("hello"));
    }

    #[test]
    fn test_drop_unsubscribes_while_other_threads_emit() {
        let bus = Arc::new(EventBus::<MemberEvent>::new());
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let emitters: Vec<_> = (0..4)
            .map(|_| {
                let bus = Arc::clone(&bus);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        bus.emit(MemberEvent::Open);
                    }
                })
            })
            .collect();

        for _ in 0..20_000 {
            let sub = bus.subscribe(|_| {});
            drop(sub);
        }

        stop.store(true, Ordering::Relaxed);
        for emitter in emitters {
            emitter.join().unwrap();
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_drop_subscription_inside_callback() {
        let bus = Arc::new(EventBus::<MemberEvent>::new());
        let slot: Arc<Mutex<Option<Subscription<MemberEvent>>>> = Arc::new(Mutex::new(None));

        let inner = Arc::clone(&slot);
        let sub = bus.subscribe(move |_| {
            inner.lock().unwrap().take();
        });
        *slot.lock().unwrap() = Some(sub);

        bus.emit(MemberEvent::Open);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscribe_from_callback_does_not_deadlock() {
        let bus = Arc::new(EventBus::<MemberEvent>::new());
        let inner_subs = Arc::new(Mutex::new(Vec::new()));

        let bus_ref = Arc::clone(&bus);
        let subs = Arc::clone(&inner_subs);
        let _sub = bus.subscribe(move |_| {
            let sub = bus_ref.subscribe(|_| {});
            subs.lock().unwrap().push(sub);
        });

        bus.emit(MemberEvent::Open);
        assert_eq!(bus.subscriber_count(), 2);
    }
}
