//! Named pub/sub with one-shot subscriptions and a catch-all tap.
//!
//! The bus serves two roles: domain notifications (collection mutation
//! events) and internal rendezvous (pending-open waiters registered as
//! one-shot triggers). Triggers fire in registration order; callbacks run
//! outside the bus lock, so a callback may subscribe, unsubscribe, or
//! fire without deadlocking, and removing a trigger mid-fire neither
//! skips nor double-fires the surviving triggers of that batch.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Callback signature: receives the event name and payload.
pub type TriggerFn<T> = Box<dyn FnMut(&str, &T) + Send>;

/// A subscription to a named event.
pub struct Trigger<T> {
    id: Option<String>,
    once: bool,
    callback: TriggerFn<T>,
}

impl<T> Trigger<T> {
    /// Creates a trigger from a callback.
    pub fn new(callback: impl FnMut(&str, &T) + Send + 'static) -> Self {
        Self {
            id: None,
            once: false,
            callback: Box::new(callback),
        }
    }

    /// Tags the trigger with an identifier, enabling override and
    /// removal.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Marks the trigger one-shot: it fires at most once and is removed
    /// at fire time.
    #[must_use]
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }
}

struct Entry<T> {
    seq: u64,
    id: Option<String>,
    once: bool,
    /// Taken while the callback is executing; an entry left in place with
    /// no callback is a placeholder holding its registration slot.
    callback: Option<TriggerFn<T>>,
}

struct Inner<T> {
    named: HashMap<String, Vec<Entry<T>>>,
    taps: Vec<Entry<T>>,
    next_seq: u64,
}

/// A named event bus.
pub struct EventBus<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventBus<T> {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                named: HashMap::new(),
                taps: Vec::new(),
                next_seq: 0,
            }),
        }
    }

    /// Registers a trigger under an event name.
    ///
    /// With `override_existing`, any trigger under the same name whose id
    /// matches the new trigger's id is removed first.
    pub fn subscribe(&self, event: &str, trigger: Trigger<T>, override_existing: bool) {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let list = inner.named.entry(event.to_string()).or_default();
        if override_existing {
            if let Some(id) = &trigger.id {
                list.retain(|entry| entry.id.as_deref() != Some(id));
            }
        }
        list.push(Entry {
            seq,
            id: trigger.id,
            once: trigger.once,
            callback: Some(trigger.callback),
        });
    }

    /// Removes the trigger with `id` under `event`. Returns whether a
    /// trigger was removed.
    pub fn unsubscribe(&self, event: &str, id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.named.get_mut(event) {
            Some(list) => {
                let before = list.len();
                list.retain(|entry| entry.id.as_deref() != Some(id));
                list.len() != before
            }
            None => false,
        }
    }

    /// Registers a catch-all tap, invoked for every fired event after its
    /// named triggers.
    pub fn tap(&self, callback: impl FnMut(&str, &T) + Send + 'static) {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.taps.push(Entry {
            seq,
            id: None,
            once: false,
            callback: Some(Box::new(callback)),
        });
    }

    /// Number of triggers currently registered under `event`.
    #[must_use]
    pub fn trigger_count(&self, event: &str) -> usize {
        self.inner
            .lock()
            .named
            .get(event)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Fires an event: invokes every currently-registered trigger for
    /// `event` in registration order, then every tap, even when no named
    /// trigger exists.
    pub fn fire(&self, event: &str, payload: &T) {
        let batch: Vec<u64> = {
            let inner = self.inner.lock();
            inner
                .named
                .get(event)
                .map(|list| list.iter().map(|entry| entry.seq).collect())
                .unwrap_or_default()
        };
        for seq in batch {
            self.dispatch_named(event, seq, payload);
        }

        let taps: Vec<u64> = {
            let inner = self.inner.lock();
            inner.taps.iter().map(|entry| entry.seq).collect()
        };
        for seq in taps {
            self.dispatch_tap(event, seq, payload);
        }
    }

    fn dispatch_named(&self, event: &str, seq: u64, payload: &T) {
        let taken = {
            let mut inner = self.inner.lock();
            let Some(list) = inner.named.get_mut(event) else {
                return;
            };
            let Some(position) = list.iter().position(|entry| entry.seq == seq) else {
                return; // removed during this batch
            };
            if list[position].callback.is_none() {
                return; // re-entrant fire is already running it
            }
            if list[position].once {
                let entry = list.remove(position);
                entry.callback.map(|callback| (callback, true))
            } else {
                list[position].callback.take().map(|callback| (callback, false))
            }
        };

        let Some((mut callback, once)) = taken else {
            return;
        };
        callback(event, payload);

        if !once {
            let mut inner = self.inner.lock();
            if let Some(list) = inner.named.get_mut(event) {
                if let Some(entry) = list.iter_mut().find(|entry| entry.seq == seq) {
                    entry.callback = Some(callback);
                }
            }
        }
    }

    fn dispatch_tap(&self, event: &str, seq: u64, payload: &T) {
        let taken = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.taps.iter_mut().find(|entry| entry.seq == seq) else {
                return;
            };
            entry.callback.take()
        };

        let Some(mut callback) = taken else {
            return;
        };
        callback(event, payload);

        let mut inner = self.inner.lock();
        if let Some(entry) = inner.taps.iter_mut().find(|entry| entry.seq == seq) {
            entry.callback = Some(callback);
        }
    }
}
