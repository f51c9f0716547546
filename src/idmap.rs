//! Process-local buffer correlating in-memory atoms with their stored
//! 64-bit ids. Bindings may be provisional: an id issued here during a
//! lookup miss need not exist as a row yet.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::model::{AtomId, Handle, NULL_ATOM_ID};

pub struct IdMap {
    inner: Mutex<Maps>,
}

struct Maps {
    by_handle: HashMap<Handle, AtomId>,
    by_id: HashMap<AtomId, Handle>,
    next: AtomId,
}

impl Maps {
    fn install(&mut self, handle: Handle, id: AtomId) {
        if let Some(old) = self.by_handle.insert(handle.clone(), id) {
            if old != id {
                self.by_id.remove(&old);
            }
        }
        self.by_id.insert(id, handle);
        if id >= self.next {
            self.next = id + 1;
        }
    }
}

impl IdMap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Maps {
                by_handle: HashMap::new(),
                by_id: HashMap::new(),
                next: 1,
            }),
        }
    }

    /// Binds `handle` to `hint` when the hint is valid and unused; otherwise
    /// allocates the next fresh id. Returns the id already bound to the
    /// handle when one exists.
    pub fn assign(&self, handle: &Handle, hint: AtomId) -> AtomId {
        let mut maps = self.inner.lock();
        if let Some(&id) = maps.by_handle.get(handle) {
            return id;
        }
        let id = if hint != NULL_ATOM_ID && !maps.by_id.contains_key(&hint) {
            hint
        } else {
            maps.next
        };
        maps.install(handle.clone(), id);
        id
    }

    /// Binds a loaded row's id to a handle, reusing the existing handle when
    /// the id is already resolved. Returns the canonical handle.
    pub fn bind(&self, handle: &Handle, id: AtomId) -> Handle {
        let mut maps = self.inner.lock();
        if let Some(existing) = maps.by_id.get(&id) {
            return existing.clone();
        }
        maps.install(handle.clone(), id);
        handle.clone()
    }

    pub fn lookup_handle(&self, handle: &Handle) -> Option<AtomId> {
        self.inner.lock().by_handle.get(handle).copied()
    }

    pub fn lookup_id(&self, id: AtomId) -> Option<Handle> {
        self.inner.lock().by_id.get(&id).cloned()
    }

    /// Ensures the next fresh allocation is strictly greater than `id`.
    pub fn reserve_upto(&self, id: AtomId) {
        let mut maps = self.inner.lock();
        if id >= maps.next {
            maps.next = id + 1;
        }
    }

    /// Drops both directions of a binding. The stored row, if any, stays.
    pub fn remove(&self, handle: &Handle) {
        let mut maps = self.inner.lock();
        if let Some(id) = maps.by_handle.remove(handle) {
            maps.by_id.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn clear(&self) {
        let mut maps = self.inner.lock();
        maps.by_handle.clear();
        maps.by_id.clear();
        maps.next = 1;
    }
}
