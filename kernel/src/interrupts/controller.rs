// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Delivers software interrupts to CPU slots.
//!
//! Each slot has a pending mask and an interrupt-enabled flag, which
//! plays the part of the flags register. [`trigger`] sets a pending
//! bit and wakes the slot if it is idling. Pending interrupts are only
//! handled when the slot's owner enables interrupts, so handlers never
//! interrupt kernel code at an arbitrary point.
//!
//! [`trigger`]: InterruptController::trigger

use crate::irq::{Irq, IrqHandler, IrqTable, NR_IRQS};
use crate::Error;
use core::fmt::Write;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;
use cpu::CpuId;
use log::{error, warn};
use rendezvous::Substrate;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// How long [`relax`](InterruptController::relax) waits
/// for an interrupt.
///
const RELAX_TIMEOUT: Duration = Duration::from_millis(10);

/// A saved interrupt-enabled flag, as returned by
/// [`save`](InterruptController::save).
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqFlags {
    Disabled,
    Enabled,
}

/// The interrupt state for a single CPU slot.
///
struct SlotInterrupts {
    // The lines waiting to be handled, one bit
    // per line.
    pending: AtomicU64,

    // Whether the slot's owner has interrupts
    // enabled.
    enabled: AtomicBool,

    // Whether the slot is running a handler. This
    // prevents handlers from nesting.
    in_handler: AtomicBool,

    // The number of times each line has been
    // handled on this slot.
    counts: Vec<AtomicU64>,
}

impl SlotInterrupts {
    fn new() -> Self {
        SlotInterrupts {
            pending: AtomicU64::new(0),
            enabled: AtomicBool::new(false),
            in_handler: AtomicBool::new(false),
            counts: (0..NR_IRQS).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}

/// Delivers interrupts to a fixed set of CPU slots.
///
pub struct InterruptController {
    substrate: Arc<dyn Substrate>,
    slots: Vec<SlotInterrupts>,
    table: spin::Mutex<IrqTable>,
    idle_timeout: Option<Duration>,
}

impl InterruptController {
    /// Returns a controller for slots `[0, cpus)`, all
    /// starting with interrupts disabled.
    ///
    /// If `idle_timeout` is set, [`idle`](InterruptController::idle)
    /// returns after that long even if nothing is pending.
    ///
    pub fn new(substrate: Arc<dyn Substrate>, cpus: usize, idle_timeout: Option<Duration>) -> Self {
        InterruptController {
            substrate,
            slots: (0..cpus).map(|_| SlotInterrupts::new()).collect(),
            table: spin::Mutex::new(IrqTable::new()),
            idle_timeout,
        }
    }

    /// Returns the number of slots served.
    ///
    pub fn num_cpus(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, cpu: CpuId) -> &SlotInterrupts {
        match self.slots.get(cpu.as_usize()) {
            Some(slot) => slot,
            None => panic!("interrupt delivered to unknown {}", cpu),
        }
    }

    /// Sets the handler for the given IRQ.
    ///
    /// # Panics
    ///
    /// If the given IRQ has already been assigned,
    /// `register_irq` will panic.
    ///
    pub fn register_irq<F>(&self, irq: Irq, handler: F)
    where
        F: Fn(CpuId, Irq) + Send + Sync + 'static,
    {
        let handler: IrqHandler = Arc::new(handler);
        self.table.lock().register(irq, handler);
    }

    /// Removes the handler for the given IRQ, returning
    /// whether one was registered.
    ///
    pub fn unregister_irq(&self, irq: Irq) -> bool {
        self.table.lock().unregister(irq)
    }

    /// Allocates an unused line for a device.
    ///
    pub fn alloc_irq(&self) -> Result<Irq, Error> {
        self.table.lock().alloc()
    }

    /// Returns an allocated line, dropping its handler.
    ///
    pub fn free_irq(&self, irq: Irq) {
        self.table.lock().free(irq);
    }

    /// Marks `irq` as pending on `cpu`, waking the CPU
    /// if it is idle.
    ///
    /// This can be called from any thread, including
    /// threads outside the kernel.
    ///
    pub fn trigger(&self, cpu: CpuId, irq: Irq) {
        let slot = self.slot(cpu);
        slot.pending.fetch_or(irq.bit(), Ordering::SeqCst);
        self.substrate.notify(&slot.pending, 1);
    }

    /// Returns the lines pending on `cpu`.
    ///
    pub fn pending(&self, cpu: CpuId) -> u64 {
        self.slot(cpu).pending.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self, cpu: CpuId) -> bool {
        self.slot(cpu).enabled.load(Ordering::SeqCst)
    }

    /// Returns whether `cpu` is currently running an
    /// interrupt handler.
    ///
    pub fn in_interrupt(&self, cpu: CpuId) -> bool {
        self.slot(cpu).in_handler.load(Ordering::SeqCst)
    }

    /// Disables interrupts on `cpu`, returning the
    /// previous state for [`restore`](InterruptController::restore).
    ///
    pub fn save(&self, cpu: CpuId) -> IrqFlags {
        if self.slot(cpu).enabled.swap(false, Ordering::SeqCst) {
            IrqFlags::Enabled
        } else {
            IrqFlags::Disabled
        }
    }

    pub fn disable(&self, cpu: CpuId) {
        self.slot(cpu).enabled.store(false, Ordering::SeqCst);
    }

    /// Enables interrupts on `cpu`, handling any that
    /// are pending.
    ///
    pub fn enable(&self, cpu: CpuId) {
        self.restore(cpu, IrqFlags::Enabled);
    }

    /// Restores interrupts on `cpu` to a state returned
    /// by [`save`](InterruptController::save).
    ///
    /// Restoring the enabled state handles any pending
    /// interrupts, unless `cpu` is already inside a
    /// handler.
    ///
    pub fn restore(&self, cpu: CpuId, flags: IrqFlags) {
        let slot = self.slot(cpu);
        match flags {
            IrqFlags::Disabled => slot.enabled.store(false, Ordering::SeqCst),
            IrqFlags::Enabled => {
                slot.enabled.store(true, Ordering::SeqCst);
                if !slot.in_handler.load(Ordering::SeqCst) {
                    self.run_pending(cpu, slot);
                }
            }
        }
    }

    /// Handles pending interrupts until none remain,
    /// lowest line first.
    ///
    fn run_pending(&self, cpu: CpuId, slot: &SlotInterrupts) {
        loop {
            let mut pending = slot.pending.swap(0, Ordering::SeqCst);
            if pending == 0 {
                return;
            }

            while pending != 0 {
                let line = pending.trailing_zeros() as u8;
                pending &= pending - 1;
                self.handle(cpu, slot, Irq::new_unsafe(line));
            }
        }
    }

    fn handle(&self, cpu: CpuId, slot: &SlotInterrupts, irq: Irq) {
        slot.enabled.store(false, Ordering::SeqCst);
        slot.in_handler.store(true, Ordering::SeqCst);
        slot.counts[irq.as_usize()].fetch_add(1, Ordering::Relaxed);

        // Don't hold the table lock while the handler
        // runs, so it can register or free lines.
        let handler = self.table.lock().handler(irq);
        match handler {
            Some(handler) => {
                // Contain the panic to this handler.
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(cpu, irq))) {
                    error!(
                        "IRQ {} handler panicked on {}: {}",
                        irq.as_u8(),
                        cpu,
                        panic_message(&*payload)
                    );
                }
            }
            None => warn!("spurious IRQ {} on {}", irq.as_u8(), cpu),
        }

        slot.in_handler.store(false, Ordering::SeqCst);
        slot.enabled.store(true, Ordering::SeqCst);
    }

    /// Blocks `cpu` until an interrupt is pending, or
    /// until the idle timeout elapses.
    ///
    /// This does not handle the interrupt; the caller
    /// should [`enable`](InterruptController::enable)
    /// interrupts afterwards.
    ///
    pub fn idle(&self, cpu: CpuId) {
        let slot = self.slot(cpu);
        self.substrate.wait(&slot.pending, 0, self.idle_timeout);
    }

    /// Waits briefly for an interrupt on `cpu`, for use
    /// in polling loops.
    ///
    pub fn relax(&self, cpu: CpuId) {
        let slot = self.slot(cpu);
        self.substrate.wait(&slot.pending, 0, Some(RELAX_TIMEOUT));
    }

    /// Returns the number of times `irq` has been handled
    /// on `cpu`.
    ///
    pub fn count(&self, cpu: CpuId, irq: Irq) -> u64 {
        self.slot(cpu).counts[irq.as_usize()].load(Ordering::Relaxed)
    }

    /// Renders a table of interrupt counts for each of
    /// `cpus`, with a row for each line that has a handler
    /// or has been handled.
    ///
    pub fn show_interrupts(&self, cpus: &[CpuId]) -> String {
        let mut out = String::new();
        let _ = write!(out, "    ");
        for cpu in cpus.iter() {
            let _ = write!(out, " {:>10}", cpu.to_string());
        }

        let _ = writeln!(out);
        let table = self.table.lock();
        for line in 0..NR_IRQS as u8 {
            let irq = Irq::new_unsafe(line);
            let counts: Vec<u64> = cpus.iter().map(|cpu| self.count(*cpu, irq)).collect();
            if !table.is_registered(irq) && counts.iter().all(|n| *n == 0) {
                continue;
            }

            let _ = write!(out, "{:>3}:", line);
            for n in counts.iter() {
                let _ = write!(out, " {:>10}", n);
            }

            let _ = writeln!(out);
        }

        out
    }
}
