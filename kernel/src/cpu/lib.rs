// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Tracks the machine's logical CPU slots.
//!
//! A CPU slot is a logical processor identity, indexed from 0. Each
//! slot is owned by at most one worker thread at a time, and the worker
//! that owns it runs kernel code as that CPU.
//!
//! ## Slot masks
//!
//! The [`SlotRegistry`] tracks three sets of slots, each in a [`CpuMask`]:
//!
//! - Possible slots, which may ever exist on this machine.
//! - Present slots, which have been prepared for bring-up.
//! - Online slots, whose idle thread has started running.
//!
//! A slot stays online until it is stopped, regardless of which thread
//! currently owns it.
//!
//! ## CPU-local identity
//!
//! The [`local`] module records which slot the calling worker owns, so
//! [`id`] can be called from anywhere in the kernel.

#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![allow(clippy::panic)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

pub mod local;

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use log::warn;
use rendezvous::fatal;

pub use local::{id, try_id};

/// The maximum number of CPU slots supported.
///
/// This matches the width of a [`CpuMask`].
///
pub const MAX_CPUS: usize = 64;

/// Uniquely identifies a CPU slot.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(u32);

impl CpuId {
    /// The slot the kernel boots on.
    ///
    pub const BOOT: CpuId = CpuId(0);

    /// Returns a CPU id if within the range [0, MAX_CPUS),
    /// or None otherwise.
    ///
    pub const fn new(id: u32) -> Option<CpuId> {
        if (id as usize) < MAX_CPUS {
            Some(CpuId(id))
        } else {
            None
        }
    }

    /// Returns a CPU id if within the range [0, MAX_CPUS),
    /// or panics otherwise.
    ///
    /// # Panics
    ///
    /// `new_unsafe` panics if `id` is out of range.
    ///
    pub const fn new_unsafe(id: u32) -> CpuId {
        if (id as usize) >= MAX_CPUS {
            panic!("invalid CPU id");
        }

        CpuId(id)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    /// Returns the CPU's bit in a [`CpuMask`].
    ///
    const fn bit(&self) -> u64 {
        1 << self.0
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CPU{}", self.0)
    }
}

/// A set of CPU slots, which can be updated atomically.
///
#[derive(Default)]
pub struct CpuMask(AtomicU64);

impl CpuMask {
    pub const fn new() -> Self {
        CpuMask(AtomicU64::new(0))
    }

    /// Adds `cpu` to the set, returning whether
    /// it was already present.
    ///
    pub fn insert(&self, cpu: CpuId) -> bool {
        self.0.fetch_or(cpu.bit(), Ordering::SeqCst) & cpu.bit() != 0
    }

    /// Removes `cpu` from the set, returning
    /// whether it was present.
    ///
    pub fn remove(&self, cpu: CpuId) -> bool {
        self.0.fetch_and(!cpu.bit(), Ordering::SeqCst) & cpu.bit() != 0
    }

    pub fn contains(&self, cpu: CpuId) -> bool {
        self.0.load(Ordering::SeqCst) & cpu.bit() != 0
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst).count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0.load(Ordering::SeqCst) == 0
    }

    /// Returns the CPUs in the set, in ascending
    /// order, as of the time of the call.
    ///
    pub fn iter(&self) -> impl Iterator<Item = CpuId> {
        let bits = self.0.load(Ordering::SeqCst);
        (0..MAX_CPUS as u32)
            .filter(move |i| bits & (1u64 << *i) != 0)
            .map(CpuId)
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|cpu| cpu.0)).finish()
    }
}

/// Tracks the possible, present, and online CPU slots.
///
#[derive(Debug, Default)]
pub struct SlotRegistry {
    possible: CpuMask,
    present: CpuMask,
    online: CpuMask,
}

impl SlotRegistry {
    pub const fn new() -> Self {
        SlotRegistry {
            possible: CpuMask::new(),
            present: CpuMask::new(),
            online: CpuMask::new(),
        }
    }

    /// Marks the first `requested` slots as possible,
    /// returning the number of possible slots.
    ///
    /// A request for no slots is raised to one, and
    /// a request for more than [`MAX_CPUS`] slots is
    /// reduced to the maximum.
    ///
    pub fn init_cpus(&self, requested: usize) -> usize {
        let n = if requested == 0 {
            warn!("no CPUs requested, using 1");
            1
        } else if requested > MAX_CPUS {
            warn!(
                "{} CPUs requested, but only {} are supported; using {}",
                requested, MAX_CPUS, MAX_CPUS
            );
            MAX_CPUS
        } else {
            requested
        };

        for i in 0..n {
            self.possible.insert(CpuId(i as u32));
        }

        n
    }

    /// Marks up to `max` possible slots as present,
    /// returning the number of present slots.
    ///
    pub fn prepare_cpus(&self, max: usize) -> usize {
        for cpu in self.possible.iter().take(max) {
            self.present.insert(cpu);
        }

        self.present.count()
    }

    /// Marks `cpu` as online.
    ///
    /// Bringing a slot online twice, or bringing an
    /// absent slot online, is fatal.
    ///
    pub fn set_online(&self, cpu: CpuId) {
        if !self.present.contains(cpu) {
            fatal!("{} brought online without being present", cpu);
        }

        if self.online.insert(cpu) {
            fatal!("{} brought online twice", cpu);
        }
    }

    /// Marks `cpu` as offline, returning whether
    /// it was online.
    ///
    pub fn set_offline(&self, cpu: CpuId) -> bool {
        self.online.remove(cpu)
    }

    pub fn is_possible(&self, cpu: CpuId) -> bool {
        self.possible.contains(cpu)
    }

    pub fn is_present(&self, cpu: CpuId) -> bool {
        self.present.contains(cpu)
    }

    pub fn is_online(&self, cpu: CpuId) -> bool {
        self.online.contains(cpu)
    }

    pub fn possible(&self) -> &CpuMask {
        &self.possible
    }

    pub fn present(&self) -> &CpuMask {
        &self.present
    }

    pub fn online(&self) -> &CpuMask {
        &self.online
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_ids() {
        assert_eq!(CpuId::new(0), Some(CpuId::BOOT));
        assert_eq!(CpuId::new(63).map(|cpu| cpu.as_usize()), Some(63));
        assert_eq!(CpuId::new(64), None);
        assert_eq!(format!("{}", CpuId::new_unsafe(5)), "CPU5");
    }

    #[test]
    #[should_panic(expected = "invalid CPU id")]
    fn cpu_id_out_of_range() {
        CpuId::new_unsafe(MAX_CPUS as u32);
    }

    #[test]
    fn cpu_mask() {
        let mask = CpuMask::new();
        assert!(mask.is_empty());
        assert!(!mask.insert(CpuId(3)));
        assert!(mask.insert(CpuId(3)));
        assert!(!mask.insert(CpuId(63)));
        assert!(mask.contains(CpuId(63)));
        assert_eq!(mask.count(), 2);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![CpuId(3), CpuId(63)]);
        assert!(mask.remove(CpuId(3)));
        assert!(!mask.remove(CpuId(3)));
        assert_eq!(format!("{:?}", mask), "{63}");
    }

    #[test]
    fn registry_clamps() {
        let registry = SlotRegistry::new();
        assert_eq!(registry.init_cpus(0), 1);

        let registry = SlotRegistry::new();
        assert_eq!(registry.init_cpus(MAX_CPUS + 10), MAX_CPUS);
        assert_eq!(registry.possible().count(), MAX_CPUS);
    }

    #[test]
    fn registry_lifecycle() {
        let registry = SlotRegistry::new();
        assert_eq!(registry.init_cpus(4), 4);
        assert_eq!(registry.prepare_cpus(2), 2);
        assert!(registry.is_possible(CpuId(3)));
        assert!(!registry.is_present(CpuId(3)));

        registry.set_online(CpuId(1));
        assert!(registry.is_online(CpuId(1)));
        assert!(!registry.is_online(CpuId(0)));
        assert!(registry.set_offline(CpuId(1)));
        assert!(!registry.set_offline(CpuId(1)));
        assert!(registry.online().is_empty());
    }
}
