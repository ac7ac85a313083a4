// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the slot ownership cell carried by each thread.
//!
//! An [`OwnerCell`] holds either [`UNOWNED`] or the index of the CPU
//! slot its thread currently owns. Handing a slot from thread A to
//! thread B is always the same sequence:
//!
//! 1. A [releases](OwnerCell::release) its cell, learning its slot.
//! 2. A [grants](OwnerCell::grant) that slot to B's cell.
//! 3. A [notifies](OwnerCell::notify) B's cell, waking B's worker.
//! 4. A [waits](OwnerCell::wait_until_owned) until its own cell is
//!    granted a slot again.
//!
//! All accesses are sequentially consistent, so everything A did
//! before the release is visible to B once it observes the grant.

use crate::fatal;
use crate::substrate::Substrate;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

/// The value held by a cell whose thread owns no slot.
///
pub const UNOWNED: u32 = u32::MAX;

/// Records which CPU slot, if any, a thread owns.
///
pub struct OwnerCell {
    slot: AtomicU32,
}

impl OwnerCell {
    /// Returns a cell that owns no slot.
    ///
    pub const fn new() -> Self {
        OwnerCell {
            slot: AtomicU32::new(UNOWNED),
        }
    }

    /// Returns a cell that already owns `slot`.
    ///
    /// This is used for threads that start out running,
    /// such as a CPU's idle thread.
    ///
    pub const fn owned_by(slot: u32) -> Self {
        OwnerCell {
            slot: AtomicU32::new(slot),
        }
    }

    /// Returns the slot currently owned, if any.
    ///
    pub fn owner(&self) -> Option<u32> {
        match self.slot.load(Ordering::SeqCst) {
            UNOWNED => None,
            slot => Some(slot),
        }
    }

    /// Returns whether the cell currently owns a slot.
    ///
    pub fn is_owned(&self) -> bool {
        self.owner().is_some()
    }

    /// Gives up the owned slot, returning its index.
    ///
    /// Releasing a cell that owns no slot is fatal.
    ///
    pub fn release(&self) -> u32 {
        let prev = self.slot.swap(UNOWNED, Ordering::SeqCst);
        if prev == UNOWNED {
            fatal!("released a slot from a cell that owned none");
        }

        prev
    }

    /// Hands `slot` to this cell.
    ///
    /// Granting to a cell that already owns a slot is
    /// fatal, as is granting the unowned sentinel.
    ///
    pub fn grant(&self, slot: u32) {
        if slot == UNOWNED {
            fatal!("granted the unowned sentinel as a slot");
        }

        if let Err(held) =
            self.slot
                .compare_exchange(UNOWNED, slot, Ordering::SeqCst, Ordering::SeqCst)
        {
            fatal!(
                "granted slot {} to a cell that already owns slot {}",
                slot,
                held
            );
        }
    }

    /// Wakes the worker waiting on this cell, returning
    /// the number of workers woken.
    ///
    /// Each cell has a single consumer, so waking more
    /// than one worker is fatal. Waking none is fine: the
    /// consumer may not have started waiting yet, and will
    /// see the grant when it does.
    ///
    pub fn notify(&self, substrate: &dyn Substrate) -> u32 {
        let woken = substrate.notify(&self.slot, u32::MAX);
        if woken > 1 {
            fatal!("notify woke {} workers on a single-consumer cell", woken);
        }

        woken
    }

    /// Blocks the calling worker until this cell has been
    /// granted a slot, returning the slot.
    ///
    /// Returns immediately if the cell already owns a
    /// slot. Spurious wakeups are absorbed.
    ///
    pub fn wait_until_owned(&self, substrate: &dyn Substrate) -> u32 {
        loop {
            let slot = self.slot.load(Ordering::SeqCst);
            if slot != UNOWNED {
                return slot;
            }

            substrate.wait(&self.slot, UNOWNED as u64, None);
        }
    }
}

impl Default for OwnerCell {
    fn default() -> Self {
        OwnerCell::new()
    }
}

impl fmt::Debug for OwnerCell {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.owner() {
            Some(slot) => write!(f, "OwnerCell({})", slot),
            None => write!(f, "OwnerCell(unowned)"),
        }
    }
}
