// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Handles CPU-local identity.
//!
//! Each worker thread records the slot it currently owns in a native
//! thread-local. The binding follows slot ownership, not the worker:
//! a worker that gives up its slot must [`unbind`] before releasing it,
//! and must [`bind`] the new slot once it is granted one.
//!
//! Once bound, a worker can call [`id`] to retrieve the slot it owns.

use crate::CpuId;
use std::cell::Cell;

thread_local! {
    static CPU_ID: Cell<Option<CpuId>> = Cell::new(None);
}

/// Records that the calling worker now owns `cpu`.
///
pub fn bind(cpu: CpuId) {
    CPU_ID.with(|id| id.set(Some(cpu)));
}

/// Records that the calling worker no longer owns
/// a slot.
///
pub fn unbind() {
    CPU_ID.with(|id| id.set(None));
}

/// Returns the slot owned by the calling worker,
/// if any.
///
#[inline]
pub fn try_id() -> Option<CpuId> {
    CPU_ID.with(|id| id.get())
}

/// Returns the slot owned by the calling worker.
///
/// # Panics
///
/// Calling `id` will panic if the calling thread does
/// not currently own a slot.
///
#[inline]
pub fn id() -> CpuId {
    match try_id() {
        Some(cpu) => cpu,
        None => panic!("cpu::id() called by a thread that owns no CPU"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn binding_is_per_thread() {
        bind(CpuId::new_unsafe(2));
        assert_eq!(id(), CpuId::new_unsafe(2));

        thread::spawn(|| {
            assert_eq!(try_id(), None);
            bind(CpuId::new_unsafe(1));
            assert_eq!(id(), CpuId::new_unsafe(1));
        })
        .join()
        .unwrap();

        assert_eq!(id(), CpuId::new_unsafe(2));
        unbind();
        assert_eq!(try_id(), None);
    }
}
