// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Handles software interrupts for each CPU slot.
//!
//! There is no interrupt hardware underneath the kernel, so interrupts
//! are simulated in software. Each CPU slot has a pending mask and an
//! interrupt-enabled flag. Any thread can [`trigger`] an interrupt on a
//! slot, which marks it pending and wakes the slot if it is idle. The
//! slot's owner handles pending interrupts when it next enables them.
//!
//! ## IRQ handling
//!
//! IRQ handlers are registered using [`register_irq`], and are passed the
//! CPU they are running on and the IRQ number. Handlers run with
//! interrupts disabled on their CPU, and never nest.
//!
//! Device collaborators can obtain a line of their own with [`alloc_irq`],
//! returning it with [`free_irq`].
//!
//! ## Idling
//!
//! A CPU with nothing to do calls [`idle`], which blocks the slot's worker
//! until an interrupt is pending, without consuming host CPU time.
//!
//! # Examples
//!
//! Count the interrupts on a line:
//!
//! ```
//! # use std::sync::Arc;
//! # use std::sync::atomic::{AtomicU64, Ordering};
//! # use cpu::CpuId;
//! # use interrupts::{InterruptController, Irq};
//! # use rendezvous::HostSubstrate;
//! let irqs = InterruptController::new(Arc::new(HostSubstrate::new()), 1, None);
//! let ticks = Arc::new(AtomicU64::new(0));
//! let counter = ticks.clone();
//! let line = irqs.alloc_irq().unwrap();
//! irqs.register_irq(line, move |_cpu, _irq| {
//!     counter.fetch_add(1, Ordering::Relaxed);
//! });
//!
//! irqs.trigger(CpuId::BOOT, line);
//! irqs.enable(CpuId::BOOT);
//! assert_eq!(ticks.load(Ordering::Relaxed), 1);
//! ```
//!
//! [`trigger`]: InterruptController::trigger
//! [`register_irq`]: InterruptController::register_irq
//! [`alloc_irq`]: InterruptController::alloc_irq
//! [`free_irq`]: InterruptController::free_irq
//! [`idle`]: InterruptController::idle

#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![allow(clippy::panic)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

mod controller;
mod irq;

pub use controller::{InterruptController, IrqFlags};
pub use irq::{Irq, IrqHandler, FIRST_EXT_IRQ, IPI_IRQ, NR_IRQS};

/// Describes an error encountered while managing
/// interrupt lines.
///
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// Every allocatable line is in use.
    ///
    #[error("no free IRQ lines")]
    NoFreeIrq,
}
