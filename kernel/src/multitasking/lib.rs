// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements cooperative multitasking across CPU slots, with each kernel
//! thread running on its own host worker.
//!
//! ## Machines
//!
//! All of the multitasking state, such as the set of threads, each CPU's
//! idle and current thread, and the scheduler, is stored in a [`Machine`].
//! The thread that calls [`Machine::bootstrap`] becomes the boot CPU's
//! idle thread. Further CPUs are started with [`Machine::cpu_up`].
//!
//! Every worker belonging to a machine can reach it with
//! [`current_machine`], so the free functions in [`scheduler`] and
//! [`thread`] act on the calling worker's machine.
//!
//! ## Threads and workers
//!
//! Each kernel thread has exactly one host worker thread for its whole
//! life. A worker only runs while its thread owns a CPU slot. Switching
//! threads hands the slot from the outgoing worker to the incoming one
//! and then blocks the outgoing worker until it is granted a slot again.
//!
//! There is no preemption. Threads reach the scheduler by calling
//! [`scheduler::switch`], [`scheduler::cond_resched`], [`thread::suspend`],
//! or [`thread::exit`], or by returning from their entry point.
//!
//! ## Inter-processor messages
//!
//! The [`ipi`] module lets one CPU ask another to reschedule, to stop, or
//! to run a function.

#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![allow(clippy::panic)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

pub mod ipi;
pub mod scheduler;
mod smp;
mod switch;
pub mod thread;
mod worker;

use crate::ipi::IpiCpu;
use crate::scheduler::Scheduler;
use crate::thread::{KernelThreadId, Thread};
use core::cell::RefCell;
use core::sync::atomic::AtomicBool;
use core::time::Duration;
use cpu::{CpuId, SlotRegistry};
use interrupts::InterruptController;
use log::info;
use rendezvous::{Completion, HostSubstrate, OwnerCell, Substrate};
use std::collections::BTreeMap;
use std::sync::Arc;
use tls::{TlsArea, TlsLayout};

/// Describes an error encountered while managing
/// threads and CPUs.
///
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The calling thread is already running as a
    /// CPU of some machine.
    ///
    #[error("the calling thread is already running as {0}")]
    AlreadyBound(CpuId),

    /// The CPU has not been prepared for bring-up.
    ///
    #[error("{0} is not present")]
    NotPresent(CpuId),

    /// The CPU has already been started.
    ///
    #[error("{0} has already been started")]
    AlreadyStarted(CpuId),

    /// The CPU is not online.
    ///
    #[error("{0} is not online")]
    NotOnline(CpuId),

    /// The CPU did not come online in time.
    ///
    #[error("{0} failed to come online")]
    CpuStart(CpuId),

    /// A host worker thread could not be started.
    ///
    #[error(transparent)]
    Worker(#[from] rendezvous::Error),

    /// The TLS blocks could not be prepared.
    ///
    #[error(transparent)]
    Tls(#[from] tls::Error),
}

/// Describes the machine to create in [`Machine::bootstrap`].
///
pub struct MachineConfig {
    cpus: usize,
    tls: TlsLayout,
    idle_timeout: Option<Duration>,
    substrate: Arc<dyn Substrate>,
}

impl MachineConfig {
    /// Returns a configuration for `cpus` CPU slots, with
    /// no TLS variables, running on native threads.
    ///
    pub fn new(cpus: usize) -> Self {
        MachineConfig {
            cpus,
            tls: TlsLayout::empty(),
            idle_timeout: None,
            substrate: Arc::new(HostSubstrate::new()),
        }
    }

    /// Sets the layout of each CPU's TLS block.
    ///
    #[must_use]
    pub fn with_tls(mut self, tls: TlsLayout) -> Self {
        self.tls = tls;
        self
    }

    /// Wakes idle CPUs periodically, even if no interrupt
    /// arrives.
    ///
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Replaces the host primitives used to run workers.
    ///
    #[must_use]
    pub fn with_substrate(mut self, substrate: Arc<dyn Substrate>) -> Self {
        self.substrate = substrate;
        self
    }
}

/// The state kept for each CPU slot.
///
pub(crate) struct PerCpu {
    // The CPU's idle thread, which runs when there
    // is nothing else to do. It is set when the CPU
    // is started.
    idle: spin::Once<Arc<Thread>>,

    // The thread that owns the CPU. This is updated
    // with the scheduler lock held, before the slot is
    // granted to the new owner.
    current: spin::Mutex<Option<Arc<Thread>>>,

    // The thread that last released the CPU, which the
    // new owner takes when it finishes the switch.
    previous: spin::Mutex<Option<Arc<Thread>>>,

    // Set when the CPU should reschedule at its next
    // opportunity.
    need_resched: AtomicBool,

    // Set when the CPU should go offline once it is
    // next idle.
    stopping: AtomicBool,

    // Signalled by a secondary CPU's idle thread once
    // the CPU is online.
    starting: Completion,

    ipi: IpiCpu,
}

impl PerCpu {
    fn new() -> Self {
        PerCpu {
            idle: spin::Once::new(),
            current: spin::Mutex::new(None),
            previous: spin::Mutex::new(None),
            need_resched: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            starting: Completion::new(),
            ipi: IpiCpu::new(),
        }
    }
}

type ThreadTable = BTreeMap<KernelThreadId, Arc<Thread>>;

/// A set of CPU slots and the threads scheduled across
/// them.
///
pub struct Machine {
    substrate: Arc<dyn Substrate>,
    cpus: SlotRegistry,
    interrupts: InterruptController,
    tls: TlsArea,

    // The run queue. Holding this lock also serialises
    // every handoff of a CPU slot between threads.
    scheduler: spin::Mutex<Scheduler>,

    // All living threads, referenced by their thread
    // id. This does not contain the idle threads.
    threads: spin::Mutex<ThreadTable>,

    // Indexed by CPU id.
    per_cpu: Vec<PerCpu>,
}

thread_local! {
    // The machine the calling worker belongs to.
    static MACHINE: RefCell<Option<Arc<Machine>>> = RefCell::new(None);
}

/// Returns the machine the calling worker belongs to,
/// if any.
///
pub fn try_current_machine() -> Option<Arc<Machine>> {
    MACHINE.with(|machine| machine.borrow().clone())
}

/// Returns the machine the calling worker belongs to.
///
/// # Panics
///
/// `current_machine` panics if called from a thread
/// that is not a worker of any machine.
///
pub fn current_machine() -> Arc<Machine> {
    match try_current_machine() {
        Some(machine) => machine,
        None => panic!("called from a thread outside any machine"),
    }
}

fn set_current_machine(machine: Option<Arc<Machine>>) {
    MACHINE.with(|current| *current.borrow_mut() = machine);
}

impl Machine {
    /// Creates a machine, adopting the calling thread as
    /// the boot CPU's idle thread.
    ///
    /// The boot CPU starts out online, with interrupts
    /// disabled. The remaining CPUs must be started with
    /// [`cpu_up`](Machine::cpu_up).
    ///
    pub fn bootstrap(config: MachineConfig) -> Result<Arc<Machine>, Error> {
        if let Some(cpu) = cpu::try_id() {
            return Err(Error::AlreadyBound(cpu));
        }

        let cpus = SlotRegistry::new();
        let n = cpus.init_cpus(config.cpus);
        cpus.prepare_cpus(n);

        let tls = TlsArea::prepare(config.tls, cpus.possible().iter())?;
        let interrupts = InterruptController::new(config.substrate.clone(), n, config.idle_timeout);
        let machine = Arc::new(Machine {
            substrate: config.substrate,
            cpus,
            interrupts,
            tls,
            scheduler: spin::Mutex::new(Scheduler::new()),
            threads: spin::Mutex::new(BTreeMap::new()),
            per_cpu: (0..n).map(|_| PerCpu::new()).collect(),
        });

        ipi::init(&machine);

        // Take the boot CPU.
        let boot = CpuId::BOOT;
        let idle = Thread::new_idle(boot, OwnerCell::new());
        idle.cell().grant(boot.as_u32());
        let per_cpu = machine.per_cpu(boot);
        per_cpu.idle.call_once(|| idle.clone());
        *per_cpu.current.lock() = Some(idle);
        machine.cpus.set_online(boot);
        machine.enter(boot);
        set_current_machine(Some(machine.clone()));

        info!("Booted {} of {} possible CPUs.", boot, n);
        Ok(machine)
    }

    /// Detaches the calling thread from the machine, once
    /// it has stopped running as any CPU.
    ///
    pub fn detach(&self) {
        self.leave();
        set_current_machine(None);
    }

    pub fn substrate(&self) -> &dyn Substrate {
        &*self.substrate
    }

    pub fn cpus(&self) -> &SlotRegistry {
        &self.cpus
    }

    pub fn interrupts(&self) -> &InterruptController {
        &self.interrupts
    }

    pub fn tls(&self) -> &TlsArea {
        &self.tls
    }

    pub(crate) fn per_cpu(&self, cpu: CpuId) -> &PerCpu {
        match self.per_cpu.get(cpu.as_usize()) {
            Some(per_cpu) => per_cpu,
            None => panic!("{} does not exist", cpu),
        }
    }

    /// Returns the thread with the given id, if it is
    /// still alive.
    ///
    pub fn thread(&self, id: KernelThreadId) -> Option<Arc<Thread>> {
        self.threads.lock().get(&id).cloned()
    }

    /// Returns the number of living threads, excluding
    /// the idle threads.
    ///
    pub fn num_threads(&self) -> usize {
        self.threads.lock().len()
    }

    /// Returns the thread running on the calling worker's
    /// CPU.
    ///
    /// # Panics
    ///
    /// `current_thread` panics if the calling worker does
    /// not own a CPU.
    ///
    pub fn current_thread(&self) -> Arc<Thread> {
        let cpu = cpu::id();
        match self.per_cpu(cpu).current.lock().as_ref() {
            Some(thread) => thread.clone(),
            None => panic!("{} has no current thread", cpu),
        }
    }

    /// Returns the idle thread for `cpu`.
    ///
    /// # Panics
    ///
    /// `idle_thread` panics if `cpu` has not been started.
    ///
    pub fn idle_thread(&self, cpu: CpuId) -> Arc<Thread> {
        match self.per_cpu(cpu).idle.get() {
            Some(idle) => idle.clone(),
            None => panic!("{} has no idle thread", cpu),
        }
    }

    /// Binds the calling worker to `cpu`, once it has
    /// been granted the slot.
    ///
    fn enter(&self, cpu: CpuId) {
        cpu::local::bind(cpu);
        self.tls.bind(cpu);
    }

    /// Clears the calling worker's CPU binding, before
    /// it releases its slot.
    ///
    fn leave(&self) {
        tls::unbind();
        cpu::local::unbind();
    }
}
