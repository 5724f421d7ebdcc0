use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

/// Opaque handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(usize);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Thread-safe publish/subscribe primitive.
///
/// The subscriber snapshot is copied under a short lock and invoked with the
/// lock released, so subscribers may subscribe or unsubscribe from within a
/// notification. A panicking subscriber is logged and skipped without
/// affecting the others.
pub struct Notifier<E> {
    subscribers: Mutex<Subscribers<E>>,
}

struct Subscribers<E> {
    next_id: usize,
    entries: Vec<(SubscriptionId, Callback<E>)>,
}

impl<E> Default for Notifier<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Notifier<E> {
    pub fn new() -> Self {
        Notifier {
            subscribers: Mutex::new(Subscribers {
                next_id: 1,
                entries: Vec::new(),
            }),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> SubscriptionId {
        let mut subscribers = self.subscribers.lock().unwrap();
        let id = SubscriptionId(subscribers.next_id);
        subscribers.next_id += 1;
        subscribers.entries.push((id, Arc::new(callback)));
        id
    }

    /// Returns true if the subscription existed and was removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap();
        let initial_count = subscribers.entries.len();
        subscribers.entries.retain(|(entry_id, _)| *entry_id != id);
        subscribers.entries.len() != initial_count
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().entries.len()
    }

    pub fn notify(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = {
            let subscribers = self.subscribers.lock().unwrap();
            subscribers.entries.iter().map(|(_, callback)| callback.clone()).collect()
        };
        for callback in snapshot {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                log::warn!("Subscriber panicked during notification, skipping it");
            }
        }
    }
}
