//! A simple, volatile, in-memory implementation of [`PayloadStore`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use pop_rs::pluggables::PayloadStore;

/// An in-memory implementation of [`PayloadStore`]. Clones share the same map, so a test can keep a
/// handle on a store it gave to a tree.
#[derive(Clone)]
pub(crate) struct MemStore(Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>);

impl MemStore {
    /// Create a new, empty `MemStore`.
    pub(crate) fn new() -> MemStore {
        MemStore(Arc::new(Mutex::new(HashMap::new())))
    }

    /// Delete `key`, e.g. to simulate a payload body that went missing.
    pub(crate) fn delete(&self, key: &[u8]) {
        self.0.lock().unwrap().remove(key);
    }

    pub(crate) fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

impl PayloadStore for MemStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.lock().unwrap().get(key).cloned()
    }

    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.0.lock().unwrap().insert(key, value);
    }
}
