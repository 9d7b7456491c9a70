// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::write_cache::WriteCache;
use std::sync::{Arc, Condvar, Mutex};

struct Slot {
    cache: Option<Arc<WriteCache>>,
    readers: usize,
}

/// Single-slot, reference-counted hand-off of the previous write cache.
///
/// While a rolled-over cache uploads, readers may still need its frames.
/// `set_when_clear` parks the cache here; readers `acquire` a handle that
/// keeps it alive, and the uploader's final `clear` blocks until every
/// handle is gone. Between install and clear the cache contents are frozen.
pub struct PreviousCache {
    slot: Mutex<Slot>,
    cond: Condvar,
}

impl Default for PreviousCache {
    fn default() -> Self {
        Self {
            slot: Mutex::new(Slot {
                cache: None,
                readers: 0,
            }),
            cond: Condvar::new(),
        }
    }
}

impl PreviousCache {
    /// Takes a read handle iff the slot is occupied.
    #[must_use]
    pub fn acquire(&self) -> Option<PrevHandle<'_>> {
        let mut slot = self.slot.lock().expect("lock is poisoned");

        let cache = slot.cache.clone()?;
        slot.readers += 1;

        Some(PrevHandle { owner: self, cache })
    }

    /// Blocks until the slot is empty, then installs `cache`.
    pub fn set_when_clear(&self, cache: Arc<WriteCache>) {
        let mut slot = self.slot.lock().expect("lock is poisoned");

        while slot.cache.is_some() {
            slot = self.cond.wait(slot).expect("lock is poisoned");
        }

        slot.cache = Some(cache);
        drop(slot);
        self.cond.notify_all();
    }

    /// Blocks until the slot is empty, without installing anything.
    pub fn wait_clear(&self) {
        let mut slot = self.slot.lock().expect("lock is poisoned");

        while slot.cache.is_some() {
            slot = self.cond.wait(slot).expect("lock is poisoned");
        }
    }

    /// Blocks until all readers released, then empties the slot.
    pub fn clear(&self) {
        let mut slot = self.slot.lock().expect("lock is poisoned");

        while slot.readers > 0 {
            slot = self.cond.wait(slot).expect("lock is poisoned");
        }

        slot.cache = None;
        drop(slot);
        self.cond.notify_all();
    }

    /// The cache currently parked in the slot, if any.
    #[must_use]
    pub fn peek_id(&self) -> Option<crate::id::SegmentId> {
        self.slot
            .lock()
            .expect("lock is poisoned")
            .cache
            .as_ref()
            .map(|c| c.id())
    }

    fn release(&self) {
        let mut slot = self.slot.lock().expect("lock is poisoned");

        slot.readers -= 1;
        let none_left = slot.readers == 0;
        drop(slot);

        if none_left {
            self.cond.notify_all();
        }
    }
}

/// Keeps the parked cache alive while a reader uses it.
pub struct PrevHandle<'a> {
    owner: &'a PreviousCache,
    cache: Arc<WriteCache>,
}

impl std::ops::Deref for PrevHandle<'_> {
    type Target = WriteCache;

    fn deref(&self) -> &Self::Target {
        &self.cache
    }
}

impl Drop for PrevHandle<'_> {
    fn drop(&mut self) {
        self.owner.release();
    }
}
