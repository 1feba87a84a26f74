use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Observers keyed by their stable id. Registering an id twice replaces the
/// earlier observer.
pub(crate) struct Subscribers<S: ?Sized> {
    inner: Arc<RwLock<HashMap<String, Arc<S>>>>,
}

impl<S: ?Sized> Clone for Subscribers<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: ?Sized> Default for Subscribers<S> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<S: ?Sized> Subscribers<S> {
    pub fn insert(&self, id: String, subscriber: Arc<S>) {
        self.write().insert(id, subscriber);
    }

    pub fn remove(&self, id: &str) -> bool {
        self.write().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Calls `notify` for every subscriber. The registry lock is released
    /// first so observers may (un)subscribe from within the callback.
    pub fn for_each(&self, notify: impl Fn(&S)) {
        let subscribers: Vec<Arc<S>> = self.read().values().cloned().collect();
        for subscriber in subscribers {
            notify(subscriber.as_ref());
        }
    }

    // Poisoning is ignored: the map is never left half-updated.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<S>>> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<S>>> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
