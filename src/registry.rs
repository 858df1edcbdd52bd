//! Strongly-typed per-topic subscriber registries. One `Registry<T>` backs
//! each of the bridge's three observer topics (zone/device updates, button
//! events, occupancy updates): a table from entity id to the callbacks
//! registered against it, plus a flat table from subscription handle to
//! callback for O(1) unsubscribe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

/// Opaque handle returned by `Registry::subscribe`; pass back to
/// `Registry::unsubscribe` to remove a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

pub struct Registry<T: Clone> {
    next_handle: AtomicU64,
    by_topic: Mutex<HashMap<u64, Vec<SubscriptionHandle>>>,
    callbacks: Mutex<HashMap<u64, Callback<T>>>,
}

impl<T: Clone> Default for Registry<T> {
    fn default() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            by_topic: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> Registry<T> {
    pub fn subscribe(
        &self,
        topic: u64,
        callback: impl Fn(T) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .lock()
            .unwrap()
            .insert(handle.0, Arc::new(callback));
        self.by_topic
            .lock()
            .unwrap()
            .entry(topic)
            .or_default()
            .push(handle);
        handle
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.callbacks.lock().unwrap().remove(&handle.0);
        let mut by_topic = self.by_topic.lock().unwrap();
        by_topic.retain(|_, handles| {
            handles.retain(|h| *h != handle);
            !handles.is_empty()
        });
    }

    /// Fan out `value` to every callback registered on `topic`, in
    /// registration order. A callback that panics is caught and logged so
    /// one failing observer can't stop delivery to the rest.
    pub fn fire(&self, topic: u64, value: T) {
        let handles = {
            let by_topic = self.by_topic.lock().unwrap();
            match by_topic.get(&topic) {
                Some(h) => h.clone(),
                None => return,
            }
        };
        let callbacks = self.callbacks.lock().unwrap();
        for handle in handles {
            if let Some(cb) = callbacks.get(&handle.0) {
                let cb = cb.clone();
                let value = value.clone();
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(value))).is_err() {
                    warn!("subscriber callback panicked; continuing fan-out");
                }
            } else {
                warn!("stale subscription handle in registry fan-out");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fires_each_subscriber_exactly_once() {
        let registry: Registry<i64> = Registry::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = calls.clone();
        let c2 = calls.clone();
        registry.subscribe(1, move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        registry.subscribe(1, move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        registry.subscribe(2, |_| panic!("wrong topic fired"));

        registry.fire(1, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let registry: Registry<i64> = Registry::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = calls.clone();
        let handle = registry.subscribe(1, move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        registry.unsubscribe(handle);
        registry.fire(1, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
