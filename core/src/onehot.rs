/// Fixed-capacity one-hot registries.
///
/// Three independent registries tag every timestep of the recurrent input:
/// address (String), instance (i64) and proposal-kind name (String). Slots
/// are assigned in first-seen order and never reassigned; the capacity is
/// the one-hot vector length, fixed at configuration time. Overflow is a
/// fatal `CapacityError` — the configured capacity hyperparameter is too
/// small for the observed program structure.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

/// Registry overflow: more distinct keys than configured slots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapacityError {
    pub capacity: usize,
}

impl fmt::Display for CapacityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "one-hot registry overflow: capacity {} exhausted", self.capacity)
    }
}

impl std::error::Error for CapacityError {}

/// Growable key → one-hot-slot mapping with a fixed slot budget.
///
/// Keys are stored in insertion order (which is also the slot order); the
/// hash index is rebuilt after deserialization, so only `keys` and `dim`
/// are persisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OneHotRegistry<K: Eq + Hash + Clone> {
    keys: Vec<K>,
    dim: usize,
    #[serde(skip)]
    index: HashMap<K, usize>,
}

impl<K: Eq + Hash + Clone> OneHotRegistry<K> {
    pub fn new(dim: usize) -> Self {
        OneHotRegistry {
            keys: Vec::new(),
            dim,
            index: HashMap::new(),
        }
    }

    /// One-hot vector length == slot capacity.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Assign the next free slot to `key` if unseen; no-op for known keys.
    /// Returns the slot index either way.
    pub fn register(&mut self, key: &K) -> Result<usize, CapacityError> {
        if let Some(&slot) = self.index.get(key) {
            return Ok(slot);
        }
        let slot = self.keys.len();
        if slot >= self.dim {
            return Err(CapacityError { capacity: self.dim });
        }
        self.keys.push(key.clone());
        self.index.insert(key.clone(), slot);
        Ok(slot)
    }

    /// Slot index of a registered key.
    ///
    /// Calling this on an unregistered key is a programming error — every
    /// lookup must be preceded by `register` (the polymorph pass guarantees
    /// this for well-formed batches).
    pub fn lookup(&self, key: &K) -> usize {
        match self.index.get(key) {
            Some(&slot) => slot,
            None => panic!("one-hot lookup of unregistered key; polymorph must run first"),
        }
    }

    /// The fixed one-hot vector for a registered key.
    pub fn one_hot(&self, key: &K) -> Vec<f32> {
        let slot = self.lookup(key);
        let mut v = vec![0.0; self.dim];
        v[slot] = 1.0;
        v
    }

    /// Registered keys in slot (first-seen) order.
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// Rebuild the hash index from the persisted key list. Must be called
    /// after deserialization.
    pub fn rebuild_index(&mut self) {
        self.index = self
            .keys
            .iter()
            .enumerate()
            .map(|(slot, k)| (k.clone(), slot))
            .collect();
    }
}
