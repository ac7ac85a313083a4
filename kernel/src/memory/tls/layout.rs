// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Describes the shape and initial contents of a TLS block.

use crate::area::active_base;
use crate::Error;
use core::alloc::Layout;
use core::fmt;
use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::sync::atomic::{AtomicU64, Ordering};

/// Writes a reserved variable's initial value into
/// a fresh block.
///
type Initialiser = Box<dyn Fn(*mut u8) + Send + Sync>;

/// Describes the size, alignment, and initial contents
/// of each CPU's TLS block.
///
pub struct TlsLayout {
    // Identifies the layout, so keys cannot be
    // used with blocks from a different layout.
    id: u64,
    size: usize,
    align: usize,
    image: Vec<u8>,
    initialisers: Vec<Initialiser>,
}

impl TlsLayout {
    /// Returns a layout for blocks of `size` bytes,
    /// aligned to `align` bytes, initialised to zero.
    ///
    pub fn new(size: usize, align: usize) -> Result<Self, Error> {
        if Layout::from_size_align(size.max(1), align).is_err() {
            return Err(Error::BadLayout { size, align });
        }

        Ok(TlsLayout {
            id: next_layout_id(),
            size,
            align,
            image: Vec::new(),
            initialisers: Vec::new(),
        })
    }

    /// Returns a layout with no space reserved.
    ///
    pub fn empty() -> Self {
        TlsLayout {
            id: next_layout_id(),
            size: 0,
            align: 1,
            image: Vec::new(),
            initialisers: Vec::new(),
        }
    }

    /// Sets the initial contents of the start of each
    /// block. The remainder of each block is zeroed.
    ///
    pub fn with_image(mut self, image: Vec<u8>) -> Result<Self, Error> {
        if image.len() > self.size {
            return Err(Error::ImageTooLarge {
                image: image.len(),
                size: self.size,
            });
        }

        self.image = image;
        Ok(self)
    }

    /// Reserves space for a variable of type `T` at the
    /// end of the layout, returning its key. Each CPU's
    /// copy starts out as `initial`.
    ///
    pub fn reserve<T>(&mut self, initial: T) -> TlsKey<T>
    where
        T: Copy + Send + Sync + 'static,
    {
        let align = align_of::<T>();
        let offset = (self.size + align - 1) & !(align - 1);
        self.size = offset + size_of::<T>();
        self.align = self.align.max(align);
        self.initialisers.push(Box::new(move |base: *mut u8| unsafe {
            base.add(offset).cast::<T>().write(initial);
        }));

        TlsKey {
            layout: self.id,
            offset,
            _marker: PhantomData,
        }
    }

    /// Returns the size of each block in bytes.
    ///
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the alignment of each block in bytes.
    ///
    pub fn align(&self) -> usize {
        self.align
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Returns the allocation layout for a block. Empty
    /// layouts still get a byte, so every block has a
    /// distinct address.
    ///
    pub(crate) fn block_layout(&self) -> Result<Layout, Error> {
        Layout::from_size_align(self.size.max(1), self.align).map_err(|_| Error::BadLayout {
            size: self.size,
            align: self.align,
        })
    }

    /// Fills a freshly allocated, zeroed block.
    ///
    /// # Safety
    ///
    /// `base` must point to a block allocated with
    /// [`block_layout`](TlsLayout::block_layout).
    ///
    pub(crate) unsafe fn initialise(&self, base: *mut u8) {
        core::ptr::copy_nonoverlapping(self.image.as_ptr(), base, self.image.len());
        for init in self.initialisers.iter() {
            init(base);
        }
    }
}

impl fmt::Debug for TlsLayout {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TlsLayout")
            .field("size", &self.size)
            .field("align", &self.align)
            .field("image", &self.image.len())
            .field("variables", &self.initialisers.len())
            .finish()
    }
}

fn next_layout_id() -> u64 {
    static NEXT_LAYOUT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_LAYOUT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Identifies a variable reserved in a [`TlsLayout`].
///
/// Reading or writing through a key accesses the copy
/// belonging to the calling worker's current CPU.
///
pub struct TlsKey<T> {
    layout: u64,
    offset: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TlsKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TlsKey<T> {}

impl<T> fmt::Debug for TlsKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TlsKey")
            .field("offset", &self.offset)
            .finish()
    }
}

impl<T: Copy> TlsKey<T> {
    /// Returns the variable's offset into each block.
    ///
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Returns the current CPU's copy of the variable.
    ///
    /// # Panics
    ///
    /// `get` panics if the calling worker has no TLS
    /// block bound, or if its block was prepared from
    /// a different layout.
    ///
    pub fn get(&self) -> T {
        let base = active_base(self.layout);
        unsafe { base.as_ptr().add(self.offset).cast::<T>().read() }
    }

    /// Overwrites the current CPU's copy of the variable.
    ///
    /// # Panics
    ///
    /// `set` panics under the same conditions as [`get`](TlsKey::get).
    ///
    pub fn set(&self, value: T) {
        let base = active_base(self.layout);
        unsafe { base.as_ptr().add(self.offset).cast::<T>().write(value) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_layouts() {
        assert_eq!(
            TlsLayout::new(16, 3).unwrap_err(),
            Error::BadLayout { size: 16, align: 3 }
        );
        assert_eq!(
            TlsLayout::new(4, 4)
                .unwrap()
                .with_image(vec![1, 2, 3, 4, 5])
                .unwrap_err(),
            Error::ImageTooLarge { image: 5, size: 4 }
        );
    }

    #[test]
    fn reserve_aligns_variables() {
        let mut layout = TlsLayout::new(3, 1).unwrap();
        let a = layout.reserve(0u64);
        let b = layout.reserve(0u8);
        let c = layout.reserve(0u32);
        assert_eq!(a.offset(), 8);
        assert_eq!(b.offset(), 16);
        assert_eq!(c.offset(), 20);
        assert_eq!(layout.size(), 24);
        assert_eq!(layout.align(), 8);
    }
}
