// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Manages per-CPU thread-local storage blocks.
//!
//! Kernel code that uses thread-local storage expects it to be local to
//! the CPU it is running on, not to the host worker thread underneath.
//! As kernel threads move between CPU slots, the TLS block a worker sees
//! must move with the slot it owns.
//!
//! ## Layout
//!
//! A [`TlsLayout`] describes the size and alignment of each block, along
//! with its initial contents. Typed variables can be reserved in a layout
//! with [`TlsLayout::reserve`], which returns a [`TlsKey`] for accessing
//! the current CPU's copy of the variable.
//!
//! ## Preparation
//!
//! [`TlsArea::prepare`] allocates one block for each possible CPU slot,
//! initialised from the layout. Blocks are never reallocated, and are
//! freed once the area is dropped and no worker has them bound.
//!
//! ## Binding
//!
//! A worker calls [`TlsArea::bind`] after it is granted a slot, making
//! that slot's block active for the calling thread, and [`unbind`] before
//! it releases the slot. Only one worker can have a block bound at once.

#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![allow(clippy::panic)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]
#![allow(unsafe_code)]

mod area;
mod layout;

pub use area::{current, unbind, TlsArea};
pub use layout::{TlsKey, TlsLayout};

use cpu::CpuId;

/// Describes an error encountered while preparing
/// thread-local storage.
///
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// The requested size and alignment do not
    /// describe a valid allocation.
    ///
    #[error("invalid TLS layout: size {size}, alignment {align}")]
    BadLayout { size: usize, align: usize },

    /// The initial image is larger than the block.
    ///
    #[error("TLS image of {image} bytes does not fit in {size} byte block")]
    ImageTooLarge { image: usize, size: usize },

    /// The block for the given CPU could not be
    /// allocated.
    ///
    #[error("failed to allocate TLS block for {0}")]
    OutOfMemory(CpuId),
}
