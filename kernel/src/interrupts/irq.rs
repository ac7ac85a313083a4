// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Identifies interrupt lines and tracks their handlers.
//!
//! Lines below [`FIRST_EXT_IRQ`] are reserved for the kernel, such as
//! [`IPI_IRQ`] for inter-processor messages. Lines from `FIRST_EXT_IRQ`
//! upwards are handed out to device collaborators by [`IrqTable::alloc`].

use crate::Error;
use cpu::CpuId;
use log::warn;
use std::sync::Arc;

/// The number of interrupt lines on each CPU.
///
pub const NR_IRQS: usize = 64;

/// The line used to deliver inter-processor messages.
///
pub const IPI_IRQ: Irq = Irq(1);

/// The first line available for allocation.
///
pub const FIRST_EXT_IRQ: Irq = Irq(10);

/// Irq represents an interrupt line.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Irq(u8);

impl Irq {
    /// Returns an IRQ if within the range [0, NR_IRQS),
    /// or None otherwise.
    ///
    pub const fn new(irq: u8) -> Option<Irq> {
        if (irq as usize) < NR_IRQS {
            Some(Irq(irq))
        } else {
            None
        }
    }

    /// Returns an IRQ if within the range [0, NR_IRQS),
    /// or panics otherwise.
    ///
    /// # Panics
    ///
    /// `new_unsafe` panics if `irq` is out of range.
    ///
    pub const fn new_unsafe(irq: u8) -> Irq {
        if (irq as usize) >= NR_IRQS {
            panic!("invalid IRQ larger than 63");
        }

        Irq(irq)
    }

    /// Returns the IRQ in the range [0, NR_IRQS).
    ///
    pub fn as_u8(&self) -> u8 {
        self.0
    }

    /// Returns the IRQ in the range [0, NR_IRQS).
    ///
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }

    /// Returns the IRQ's bit in a pending mask.
    ///
    pub(crate) fn bit(&self) -> u64 {
        1 << self.0
    }
}

/// Represents an IRQ handler function.
///
/// Handlers are passed the CPU they are running on
/// and the line being handled.
///
pub type IrqHandler = Arc<dyn Fn(CpuId, Irq) + Send + Sync>;

/// Tracks the registered handlers and which lines
/// have been allocated.
///
pub(crate) struct IrqTable {
    handlers: Vec<Option<IrqHandler>>,
    allocated: u64,
}

impl IrqTable {
    pub fn new() -> Self {
        IrqTable {
            handlers: vec![None; NR_IRQS],
            allocated: 0,
        }
    }

    /// Sets the handler for the given IRQ.
    ///
    /// If the given IRQ has already been assigned,
    /// `register` will panic.
    ///
    pub fn register(&mut self, irq: Irq, handler: IrqHandler) {
        if self.handlers[irq.as_usize()].is_some() {
            panic!("IRQ {:?} has already been registered", irq);
        }

        self.handlers[irq.as_usize()] = Some(handler);
    }

    /// Removes the handler for the given IRQ, returning
    /// whether one was registered.
    ///
    pub fn unregister(&mut self, irq: Irq) -> bool {
        self.handlers[irq.as_usize()].take().is_some()
    }

    pub fn handler(&self, irq: Irq) -> Option<IrqHandler> {
        self.handlers[irq.as_usize()].clone()
    }

    pub fn is_registered(&self, irq: Irq) -> bool {
        self.handlers[irq.as_usize()].is_some()
    }

    /// Allocates the lowest free line at or above
    /// [`FIRST_EXT_IRQ`].
    ///
    pub fn alloc(&mut self) -> Result<Irq, Error> {
        for i in FIRST_EXT_IRQ.as_u8()..NR_IRQS as u8 {
            let irq = Irq(i);
            if self.allocated & irq.bit() == 0 {
                self.allocated |= irq.bit();
                return Ok(irq);
            }
        }

        Err(Error::NoFreeIrq)
    }

    /// Returns a line to the free pool, dropping its
    /// handler.
    ///
    pub fn free(&mut self, irq: Irq) {
        if self.allocated & irq.bit() == 0 {
            warn!("freeing IRQ {} which is not allocated", irq.as_u8());
            return;
        }

        self.allocated &= !irq.bit();
        self.handlers[irq.as_usize()] = None;
    }
}
