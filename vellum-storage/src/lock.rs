//! Keyed async locks guarding per-document critical sections.
//!
//! One `LockManager` is shared (behind an `Arc`) by every storage in the
//! process, so two storages opened over the same space contend on the same
//! lock. The table holds weak references and sweeps dead entries on each
//! acquire, so idle docs cost nothing.
//!
//! Locks are in-process only. Across OS processes the conditional snapshot
//! write in the doc backend is the safety net.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Resource class a lock serializes access to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    /// Per-doc merge and update section.
    DocUpdate,
}

/// Lock table key: one lock per (space, class, doc).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub space_id: String,
    pub class: ResourceClass,
    pub doc_id: String,
}

impl LockKey {
    pub fn doc_update(space_id: &str, doc_id: &str) -> Self {
        Self {
            space_id: space_id.to_owned(),
            class: ResourceClass::DocUpdate,
            doc_id: doc_id.to_owned(),
        }
    }
}

/// Scoped guard; dropping it releases the lock, on every exit path.
pub struct LockGuard {
    _guard: OwnedMutexGuard<()>,
}

/// Process-wide keyed lock table.
#[derive(Default)]
pub struct LockManager {
    entries: Mutex<HashMap<LockKey, Weak<Mutex<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting while another task holds it.
    pub async fn acquire(&self, key: LockKey) -> LockGuard {
        let cell = {
            let mut entries = self.entries.lock().await;
            entries.retain(|_, slot| slot.strong_count() > 0);
            match entries.get(&key).and_then(Weak::upgrade) {
                Some(cell) => cell,
                None => {
                    let cell = Arc::new(Mutex::new(()));
                    entries.insert(key, Arc::downgrade(&cell));
                    cell
                }
            }
        };
        // The table mutex is released before waiting on the cell, so other
        // keys stay acquirable while this one is contended.
        LockGuard {
            _guard: cell.lock_owned().await,
        }
    }

    /// Number of keys currently held or awaited.
    pub async fn active_locks(&self) -> usize {
        let entries = self.entries.lock().await;
        entries
            .values()
            .filter(|slot| slot.strong_count() > 0)
            .count()
    }
}
