// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Allocates the per-CPU TLS blocks and binds them to workers.

use crate::layout::TlsLayout;
use crate::Error;
use core::alloc::Layout;
use core::cell::RefCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use cpu::CpuId;
use log::debug;
use std::alloc::{alloc_zeroed, dealloc};
use std::sync::Arc;

thread_local! {
    // The block bound to this worker, if any.
    static ACTIVE: RefCell<Option<Binding>> = RefCell::new(None);
}

/// A worker's claim on a block. The block stays
/// allocated while it is bound, even if its area
/// has been dropped.
///
struct Binding {
    layout: u64,
    block: Arc<TlsBlock>,
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.block.bound.store(false, Ordering::Release);
    }
}

/// A single CPU's TLS block.
///
struct TlsBlock {
    base: NonNull<u8>,
    layout: Layout,

    // Set while a worker has the block bound. At
    // most one worker can bind a block at a time.
    bound: AtomicBool,
}

// The block's contents are only accessed through the
// single binding held in `bound`.
unsafe impl Send for TlsBlock {}
unsafe impl Sync for TlsBlock {}

impl TlsBlock {
    fn contains(&self, ptr: *const u8) -> bool {
        let start = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        start <= addr && addr < start + self.layout.size()
    }
}

impl Drop for TlsBlock {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// The TLS blocks for every possible CPU slot.
///
pub struct TlsArea {
    layout: TlsLayout,
    // Indexed by CPU id.
    blocks: Vec<Option<Arc<TlsBlock>>>,
}

impl TlsArea {
    /// Allocates and initialises a TLS block for each
    /// of `cpus`.
    ///
    pub fn prepare<I>(layout: TlsLayout, cpus: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = CpuId>,
    {
        let block_layout = layout.block_layout()?;
        let mut blocks: Vec<Option<Arc<TlsBlock>>> = Vec::new();
        for cpu in cpus {
            let base = unsafe { alloc_zeroed(block_layout) };
            let base = NonNull::new(base).ok_or(Error::OutOfMemory(cpu))?;
            unsafe { layout.initialise(base.as_ptr()) };

            if blocks.len() <= cpu.as_usize() {
                blocks.resize_with(cpu.as_usize() + 1, || None);
            }

            blocks[cpu.as_usize()] = Some(Arc::new(TlsBlock {
                base,
                layout: block_layout,
                bound: AtomicBool::new(false),
            }));
        }

        debug!(
            "prepared {} TLS blocks of {} bytes",
            blocks.iter().flatten().count(),
            block_layout.size()
        );

        Ok(TlsArea { layout, blocks })
    }

    pub fn layout(&self) -> &TlsLayout {
        &self.layout
    }

    /// Returns the base address of `cpu`'s block.
    ///
    pub fn block_base(&self, cpu: CpuId) -> Option<NonNull<u8>> {
        self.block(cpu).map(|block| block.base)
    }

    fn block(&self, cpu: CpuId) -> Option<&Arc<TlsBlock>> {
        self.blocks.get(cpu.as_usize()).and_then(Option::as_ref)
    }

    /// Makes `cpu`'s block the calling worker's active
    /// TLS block, replacing any block it had bound.
    ///
    /// The block remains usable by the worker until it
    /// calls [`unbind`], even if the area is dropped.
    ///
    /// # Panics
    ///
    /// `bind` panics if no block was prepared for `cpu`,
    /// or if another worker has `cpu`'s block bound.
    ///
    pub fn bind(&self, cpu: CpuId) {
        let block = match self.block(cpu) {
            Some(block) => block.clone(),
            None => panic!("no TLS block prepared for {}", cpu),
        };

        unbind();
        if block
            .bound
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("TLS block for {} is bound by another worker", cpu);
        }

        let binding = Binding {
            layout: self.layout.id(),
            block,
        };

        ACTIVE.with(|active| *active.borrow_mut() = Some(binding));
    }

    /// Returns whether a worker has `cpu`'s block bound.
    ///
    pub fn is_bound(&self, cpu: CpuId) -> bool {
        self.block(cpu)
            .map_or(false, |block| block.bound.load(Ordering::Acquire))
    }

    /// Returns the CPU whose block contains `ptr`, if
    /// any.
    ///
    pub fn owner_of<T>(&self, ptr: *const T) -> Option<CpuId> {
        let ptr = ptr as *const u8;
        self.blocks
            .iter()
            .enumerate()
            .find(|(_, block)| block.as_ref().map_or(false, |block| block.contains(ptr)))
            .and_then(|(i, _)| CpuId::new(i as u32))
    }
}

/// Clears the calling worker's active TLS block.
///
pub fn unbind() {
    let binding = ACTIVE.with(|active| active.borrow_mut().take());
    drop(binding);
}

/// Returns the base address of the calling worker's
/// active TLS block, if any.
///
pub fn current() -> Option<NonNull<u8>> {
    ACTIVE.with(|active| active.borrow().as_ref().map(|binding| binding.block.base))
}

/// Returns the active block's base address, checking
/// that it was prepared from the layout `layout`.
///
/// The address stays valid until the calling worker
/// next binds or unbinds.
///
pub(crate) fn active_base(layout: u64) -> NonNull<u8> {
    ACTIVE.with(|active| match active.borrow().as_ref() {
        None => panic!("TLS accessed by a thread with no block bound"),
        Some(binding) if binding.layout != layout => {
            panic!("TLS key used with a block from another layout")
        }
        Some(binding) => binding.block.base,
    })
}
