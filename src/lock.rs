use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Per-key mutual exclusion for integration layers that share one engine
/// across threads.
///
/// The engine itself is single-writer and lock-free internally; two
/// concurrent mutating operations on the same parent key can interleave
/// their sweep and add phases and corrupt that parent's chunk set. Callers
/// hold the key's mutex for the duration of each mutating engine call:
///
/// ```
/// # use notedex::lock::KeyedLocks;
/// let locks = KeyedLocks::default();
/// let slot = locks.get("42");
/// let _guard = slot.lock().unwrap_or_else(|p| p.into_inner());
/// // engine.upsert(...) while the guard is held
/// ```
#[derive(Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    /// The mutex for `key`; the same key always yields the same mutex.
    pub fn get(&self, key: &str) -> Arc<Mutex<()>> {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        slots.entry(key.to_string()).or_default().clone()
    }
}
