/// In-memory key-value store behind a replica
///
/// Rebuilt from the participant log on every start; never persisted on its own.
use std::collections::HashMap;

/// Trait for replica storage backends
pub trait KvStore: Send {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    /// Returns whether `key` already had a value.
    fn put(&mut self, key: &[u8], value: Vec<u8>) -> bool;
    /// Returns whether `key` was present.
    fn delete(&mut self, key: &[u8]) -> bool;
    fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory store (default)
#[derive(Debug, Default, Clone)]
pub struct MemStore {
    map: HashMap<Vec<u8>, Vec<u8>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.get(key).cloned()
    }

    fn put(&mut self, key: &[u8], value: Vec<u8>) -> bool {
        self.map.insert(key.to_vec(), value).is_some()
    }

    fn delete(&mut self, key: &[u8]) -> bool {
        self.map.remove(key).is_some()
    }

    fn contains(&self, key: &[u8]) -> bool {
        self.map.contains_key(key)
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}
