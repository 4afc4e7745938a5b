//! # Thread Registry
//!
//! Maps the OS threads of a runtime to dense indices `0..N`.
//!
//! The map is built once, after every worker is spawned and before any job
//! runs, and is read-only afterwards. Fibers migrate between threads, so
//! lookups must happen at the point of use and never be cached across a
//! suspension.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;
use std::thread::ThreadId;

/// Frozen `ThreadId` to index map.
#[derive(Default)]
pub struct ThreadRegistry {
    map: OnceLock<HashMap<ThreadId, u32>>,
}

impl ThreadRegistry {
    /// An empty, unfrozen registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the thread map.
    ///
    /// # Panics
    ///
    /// Panics if called twice or if two entries share a thread.
    pub fn freeze(&self, entries: impl IntoIterator<Item = (ThreadId, u32)>) {
        let mut map = HashMap::new();
        for (id, index) in entries {
            let previous = map.insert(id, index);
            assert!(previous.is_none(), "thread {:?} registered twice", id);
        }
        assert!(self.map.set(map).is_ok(), "thread registry frozen twice");
    }

    /// Whether [`ThreadRegistry::freeze`] has run.
    pub fn is_frozen(&self) -> bool {
        self.map.get().is_some()
    }

    /// Index of `id`, if registered.
    pub fn index_of(&self, id: ThreadId) -> Option<u32> {
        self.map.get()?.get(&id).copied()
    }

    /// Number of registered threads.
    pub fn len(&self) -> usize {
        self.map.get().map_or(0, HashMap::len)
    }

    /// Whether no threads are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ThreadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRegistry")
            .field("frozen", &self.is_frozen())
            .field("threads", &self.len())
            .finish()
    }
}
