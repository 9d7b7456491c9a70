// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{Arc, Mutex};

/// Size of one pooled buffer slab
pub const SLAB_SIZE: usize = 1_024 * 1_024;

/// Buffers above this size are dropped instead of pooled
pub const MAX_POOLED_SIZE: usize = 8 * 1_024 * 1_024;

/// Shared pool of byte buffers used by the read and write paths.
///
/// Hands out 1 MiB slabs and recycles returned ones, so steady-state
/// I/O does not allocate. One pool exists per disk.
#[derive(Clone, Default)]
pub struct BufferPool(Arc<Mutex<Vec<Vec<u8>>>>);

impl BufferPool {
    /// Takes a cleared slab with at least [`SLAB_SIZE`] capacity.
    #[must_use]
    pub fn get(&self) -> Vec<u8> {
        let mut pool = self.0.lock().expect("lock is poisoned");

        pool.pop().unwrap_or_else(|| Vec::with_capacity(SLAB_SIZE))
    }

    /// Returns a slab to the pool.
    ///
    /// Buffers that have grown past [`MAX_POOLED_SIZE`] are dropped.
    pub fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() > MAX_POOLED_SIZE {
            return;
        }
        buf.clear();

        self.0.lock().expect("lock is poisoned").push(buf);
    }

    #[cfg(test)]
    pub(crate) fn pooled(&self) -> usize {
        self.0.lock().expect("lock is poisoned").len()
    }
}
