// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Hands logical CPU slots between host worker threads.
//!
//! The kernel runs each of its threads on a dedicated host worker thread,
//! rather than switching stacks on a single execution context. A worker
//! may only execute kernel code while it owns a CPU slot, and ownership is
//! passed from one worker to the next through an [`OwnerCell`].
//!
//! ## Host primitives
//!
//! Everything here is built from three host primitives, exposed through
//! the [`Substrate`] trait:
//!
//! - Spawn a new worker thread.
//! - Block until an atomic word no longer holds an expected value.
//! - Wake workers blocked on an atomic word.
//!
//! [`HostSubstrate`] implements these using native threads and a parking
//! lot keyed on the address of the atomic word.
//!
//! ## Fatal errors
//!
//! A slot that is granted twice, or released while not held, means two
//! workers could run on the same CPU at once. There is no way to recover
//! from this, so these protocol violations are reported with [`fatal!`],
//! which logs the violation and aborts the process.

#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![allow(clippy::panic)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

mod cell;
mod completion;
mod substrate;

use core::fmt;

pub use cell::{OwnerCell, UNOWNED};
pub use completion::Completion;
pub use substrate::{AtomicWord, HostSubstrate, Substrate, WaitResult, Worker, WorkerEntry};

/// Describes an error encountered while using the
/// host substrate.
///
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The host could not start a new worker thread.
    ///
    #[error("failed to spawn worker {name:?}: {source}")]
    WorkerSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Reports a violation of the slot ownership protocol
/// and aborts the process.
///
/// Prefer the [`fatal!`] macro, which formats its
/// arguments.
///
#[cold]
#[inline(never)]
pub fn abort_with(args: fmt::Arguments) -> ! {
    log::error!("fatal: {}", args);
    std::process::abort();
}

/// Logs a protocol violation and aborts the process.
///
/// ```no_run
/// rendezvous::fatal!("slot {} granted twice", 3);
/// ```
///
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {
        $crate::abort_with(format_args!($($arg)+))
    };
}
