//! Subscriber registry for lifecycle and device events.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use deckwire_frame::{event_type, Message, CONNECT_EVENT, DISCONNECT_EVENT};
use tracing::{error, trace};

/// Error type a subscriber callback may return.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

type Callback = Arc<dyn Fn(&Event) -> std::result::Result<(), CallbackError> + Send + Sync>;

/// Handle returned by [`EventEmitter::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Something published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A link was established; carries the endpoint description.
    Connect { endpoint: String },
    /// A link was lost or closed.
    Disconnect { reason: String },
    /// An inbound message that resolved no pending transaction.
    Message(Message),
}

impl Event {
    /// The event type this event is published under.
    pub fn event_type(&self) -> Cow<'static, str> {
        match self {
            Event::Connect { .. } => Cow::Borrowed(CONNECT_EVENT),
            Event::Disconnect { .. } => Cow::Borrowed(DISCONNECT_EVENT),
            Event::Message(message) => event_type(message.command),
        }
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: HashMap<String, Vec<(SubscriptionId, Callback)>>,
}

/// Maps event types to ordered subscriber lists.
///
/// `publish` runs callbacks on the calling task, in subscription order,
/// against a snapshot taken when the publish starts. Callbacks may
/// subscribe or unsubscribe (including themselves) while being invoked.
#[derive(Default)]
pub struct EventEmitter {
    registry: Mutex<Registry>,
}

impl EventEmitter {
    /// Create an empty emitter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `event_type`.
    pub fn subscribe<F>(&self, event_type: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) -> std::result::Result<(), CallbackError> + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry
            .subscribers
            .entry(event_type.into())
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.lock();
        let mut removed = false;
        registry.subscribers.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|(sub, _)| *sub != id);
            removed |= subs.len() != before;
            !subs.is_empty()
        });
        removed
    }

    /// Invoke every subscriber of `event.event_type()`.
    ///
    /// Returns the number of callbacks that completed successfully. A
    /// callback that errors or panics is logged and skipped.
    pub fn publish(&self, event: &Event) -> usize {
        let kind = event.event_type();
        let snapshot: Vec<(SubscriptionId, Callback)> =
            match self.lock().subscribers.get(kind.as_ref()) {
                Some(subs) => subs.clone(),
                None => return 0,
            };

        trace!(event = %kind, subscribers = snapshot.len(), "publishing");
        let mut delivered = 0;
        for (id, callback) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(err)) => {
                    error!(event = %kind, subscription = %id, error = %err, "subscriber failed");
                }
                Err(panic) => {
                    error!(
                        event = %kind,
                        subscription = %id,
                        panic = panic_message(&*panic),
                        "subscriber panicked"
                    );
                }
            }
        }
        delivered
    }

    /// Number of subscribers currently registered for `event_type`.
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.lock()
            .subscribers
            .get(event_type)
            .map_or(0, Vec::len)
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.lock();
        f.debug_struct("EventEmitter")
            .field("event_types", &registry.subscribers.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn button() -> Event {
        Event::Message(Message::new(0x00, None, &b"\x07\x00"[..]))
    }

    #[test]
    fn dispatch_follows_subscription_order() {
        let emitter = EventEmitter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let seen = seen.clone();
            emitter.subscribe("button", move |_| {
                seen.lock().unwrap().push(n);
                Ok(())
            });
        }

        assert_eq!(emitter.publish(&button()), 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn failing_subscriber_does_not_stop_others() {
        let emitter = EventEmitter::new();
        let calls = Arc::new(AtomicUsize::new(0));

        emitter.subscribe("button", |_| Err("bad callback".into()));
        emitter.subscribe("button", |_| panic!("callback exploded"));
        let counter = calls.clone();
        emitter.subscribe("button", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(emitter.publish(&button()), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_during_publish_uses_snapshot() {
        let emitter = Arc::new(EventEmitter::new());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(None::<SubscriptionId>));

        {
            let emitter_ref = Arc::downgrade(&emitter);
            let calls = calls.clone();
            let second = second.clone();
            emitter.subscribe("button", move |_| {
                calls.lock().unwrap().push("first");
                if let (Some(emitter), Some(id)) = (emitter_ref.upgrade(), *second.lock().unwrap())
                {
                    emitter.unsubscribe(id);
                }
                Ok(())
            });
        }
        {
            let calls = calls.clone();
            let id = emitter.subscribe("button", move |_| {
                calls.lock().unwrap().push("second");
                Ok(())
            });
            *second.lock().unwrap() = Some(id);
        }
        {
            let calls = calls.clone();
            emitter.subscribe("button", move |_| {
                calls.lock().unwrap().push("third");
                Ok(())
            });
        }

        emitter.publish(&button());
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second", "third"]);

        calls.lock().unwrap().clear();
        emitter.publish(&button());
        assert_eq!(*calls.lock().unwrap(), vec!["first", "third"]);
    }

    #[test]
    fn unsubscribe_unknown_id() {
        let emitter = EventEmitter::new();
        let id = emitter.subscribe("rotate", |_| Ok(()));
        assert!(emitter.unsubscribe(id));
        assert!(!emitter.unsubscribe(id));
        assert_eq!(emitter.subscriber_count("rotate"), 0);
    }

    #[test]
    fn lifecycle_event_types() {
        let connect = Event::Connect {
            endpoint: "ws://10.0.0.5".to_string(),
        };
        assert_eq!(connect.event_type(), CONNECT_EVENT);
        assert_eq!(button().event_type(), "button");
        assert_eq!(EventEmitter::new().publish(&connect), 0);
    }
}
