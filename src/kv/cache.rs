use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Cache is the key-value state. Reads share a lock; writes and restores take it exclusively.
///
/// The map lives behind an `Arc` so that capturing a snapshot only clones a pointer under the read
/// lock. A write that races with a live capture copies the map first (`Arc::make_mut`), leaving the
/// captured image untouched.
#[derive(Default)]
pub(crate) struct Cache {
    inner: RwLock<Arc<HashMap<String, String>>>,
}

impl Cache {
    pub(crate) fn new() -> Self {
        Cache::default()
    }

    pub(crate) fn get(&self, key: &str) -> Option<String> {
        self.inner
            .read()
            .expect("Cache.get() lock poison")
            .get(key)
            .cloned()
    }

    pub(crate) fn set(&self, key: String, value: String) {
        let mut guard = self.inner.write().expect("Cache.set() lock poison");
        Arc::make_mut(&mut guard).insert(key, value);
    }

    pub(crate) fn capture(&self) -> Arc<HashMap<String, String>> {
        self.inner.read().expect("Cache.capture() lock poison").clone()
    }

    pub(crate) fn replace(&self, entries: HashMap<String, String>) {
        *self.inner.write().expect("Cache.replace() lock poison") = Arc::new(entries);
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.read().expect("Cache.len() lock poison").len()
    }
}
