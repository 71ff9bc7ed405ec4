//! Observer lists with explicit subscription handles.
//!
//! Every event surface in the crate (channel handlers, pairing changes,
//! device samples) is a [`Subscribers`] list. Callbacks are invoked
//! synchronously, in subscription order, on a snapshot of the list taken
//! before the first call. A callback may therefore subscribe or unsubscribe
//! (itself included) without deadlocking; the change applies from the next
//! emission.
//!
//! ```
//! use companion_link::event::Subscribers;
//!
//! let subscribers = Subscribers::<u32>::new();
//! let id = subscribers.subscribe(|value| println!("got {value}"));
//! subscribers.emit(&7);
//! assert!(subscribers.unsubscribe(id));
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Handle returned by a subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Allocate a process-unique subscription id.
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered list of callbacks for events of type `T`.
pub struct Subscribers<T> {
    callbacks: Mutex<Vec<(SubscriptionId, Callback<T>)>>,
}

impl<T> Subscribers<T> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback. It runs after every callback registered before it.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId::next();
        self.callbacks
            .lock()
            .expect("Subscribers mutex poisoned")
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback. Returns `false` if the id was not subscribed here.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.callbacks.lock().expect("Subscribers mutex poisoned");
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    /// Invoke every callback with `event`. Returns the number invoked.
    pub fn emit(&self, event: &T) -> usize {
        let snapshot: Vec<Callback<T>> = self
            .callbacks
            .lock()
            .expect("Subscribers mutex poisoned")
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in &snapshot {
            callback(event);
        }
        snapshot.len()
    }

    /// Drop every callback.
    pub fn clear(&self) {
        self.callbacks
            .lock()
            .expect("Subscribers mutex poisoned")
            .clear();
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.callbacks
            .lock()
            .expect("Subscribers mutex poisoned")
            .len()
    }

    /// Returns true if nothing is subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Subscribers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("count", &self.len())
            .finish()
    }
}
