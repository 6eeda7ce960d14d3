//! Thread safe in-memory stores for public discovery material.
//!
//! Reconcilers are the only writers, HTTP handlers are the only readers.
//! Values cross the store boundary by value: `write` takes ownership and
//! `read` hands out a clone, so a handler can never mutate a cached buffer
//! in place.

pub mod certificate;
pub mod openidmeta;

use std::collections::HashMap;

use parking_lot::RwLock;

/// Concurrency safe key/value store generic over the cached payload.
///
/// The `Clone` bound is the deep-copy function of the store: payload types
/// opt in by implementing it (all current payloads own plain byte buffers,
/// for which `clone` is a deep copy). The store performs no validation on
/// the inputs.
#[derive(Debug, Default)]
pub struct Store<T: Clone> {
    entries: RwLock<HashMap<String, T>>,
}

impl<T: Clone> Store<T> {
    /// Returns a ready for use [`Store`].
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Retrieves a copy of the entry stored under `key`.
    pub fn read(&self, key: &str) -> Option<T> {
        self.entries.read().get(key).cloned()
    }

    /// Sets an entry. An existing entry under the same key is replaced.
    pub fn write(&self, key: impl Into<String>, value: T) {
        self.entries.write().insert(key.into(), value);
    }

    /// Removes the entry under `key` if present. Idempotent.
    pub fn delete(&self, key: &str) {
        self.entries.write().remove(key);
    }

    /// Returns the number of entries currently stored.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns `true` if the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
