//! Synchronous event fan-out with scoped subscriptions.
//!
//! Every component that publishes events owns an [`Emitter`]. Registering a
//! listener returns a [`Subscription`]; dropping it (or calling
//! [`Subscription::unsubscribe`]) removes the listener. Teardown never depends
//! on some other owner letting go of the emitter first.
//!
//! ```text
//! Emitter<E> ──emit(&E)──► listener 1
//!            ├───────────► listener 2
//!            └───────────► listener N     (in registration order)
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: u64,
    listeners: Vec<(u64, Listener<E>)>,
}

/// Many-to-many publisher for events of type `E`.
///
/// Cloning an emitter yields another handle onto the same listener set.
pub struct Emitter<E> {
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E: 'static> Emitter<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    /// Register a listener. It stays registered until the returned
    /// [`Subscription`] is dropped.
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = lock(&self.registry);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.listeners.push((id, Arc::new(listener)));
            id
        };

        let weak: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.registry);
        Subscription::new(move || {
            if let Some(registry) = weak.upgrade() {
                lock(&registry).listeners.retain(|(lid, _)| *lid != id);
            }
        })
    }

    /// Deliver `event` to every listener registered at the time of the call.
    ///
    /// The listener set is snapshotted first, so listeners may subscribe or
    /// unsubscribe from inside a callback.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = lock(&self.registry)
            .listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in snapshot {
            listener(event);
        }
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        lock(&self.registry).listeners.len()
    }

    /// Drop every listener. Outstanding subscriptions become no-ops.
    pub fn clear(&self) {
        lock(&self.registry).listeners.clear();
    }
}

impl<E: 'static> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for Emitter<E> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<E> fmt::Debug for Emitter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = lock(&self.registry).listeners.len();
        f.debug_struct("Emitter").field("listeners", &count).finish()
    }
}

fn lock<E>(registry: &Mutex<Registry<E>>) -> MutexGuard<'_, Registry<E>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle returned by [`Emitter::subscribe`]. Unsubscribes on drop.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Wrap an arbitrary teardown action.
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Unregister now instead of at drop time.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
