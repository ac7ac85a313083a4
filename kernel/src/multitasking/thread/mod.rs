// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements kernel threads, each running on its own host worker.
//!
//! This module allows the kernel to start an arbitrary number of threads,
//! scheduling them across the machine's CPUs. Threads can sleep, be
//! resumed, and exit as needed.
//!
//! ## Manipulating threads
//!
//! Threads can be created without being started using
//! [`Machine::create_kernel_thread`]. This allows the caller to manipulate
//! the thread's state (or make use of its thread id) before then starting
//! the thread with [`scheduler::resume`](crate::scheduler::resume).
//! Alternatively, a thread can be started immediately by using
//! [`Machine::start_kernel_thread`].
//!
//! A running thread may terminate its execution by calling [`exit`] or by
//! returning from its entry point, or pause its execution by calling
//! [`suspend`]. A suspended thread is resumed by calling
//! [`scheduler::resume`](crate::scheduler::resume) (or
//! [`KernelThreadId.resume`](KernelThreadId::resume)).
//!
//! Calling [`debug`] (or [`Thread::debug`]) will log debug info about the
//! thread.

use crate::{current_machine, Machine};
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use cpu::CpuId;
use crossbeam::atomic::AtomicCell;
use log::info;
use rendezvous::{OwnerCell, Worker};
use std::sync::Arc;

/// The code a kernel thread runs.
///
pub type ThreadEntry = Box<dyn FnOnce() + Send + 'static>;

/// Puts the current thread to sleep indefinitely
/// and switches to the next runnable thread. The
/// thread can be awoken later by calling [`scheduler::resume`](crate::scheduler::resume)
/// or by calling its [`KernelThreadId.resume`](KernelThreadId::resume).
///
/// # Panics
///
/// `suspend` will panic if called by the idle thread,
/// which must execute indefinitely to manage the
/// CPU.
///
pub fn suspend() {
    current_machine().suspend();
}

/// Terminates the current thread and switches to
/// the next runnable thread.
///
/// This unwinds the thread's stack back to its
/// worker, which then gives up the CPU.
///
/// # Panics
///
/// `exit` will panic if called by the idle thread,
/// which must execute indefinitely to manage the
/// CPU.
///
pub fn exit() -> ! {
    let current = current_machine().current_thread();
    if current.is_idle() {
        panic!("idle thread tried to exit");
    }

    drop(current);
    std::panic::resume_unwind(Box::new(ExitRequest));
}

/// Returns the currently executing thread.
///
/// # Panics
///
/// `current_thread` will panic if called from outside
/// a kernel thread.
///
pub fn current_thread() -> Arc<Thread> {
    current_machine().current_thread()
}

/// Logs debug info about the currently executing thread.
///
/// Note: to debug a different thread, call its [`debug`](Thread::debug)
/// method.
///
pub fn debug() {
    current_thread().debug();
}

/// The unwind payload used by [`exit`].
///
pub(crate) struct ExitRequest;

/// Uniquely identifies a kernel thread.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelThreadId(u64);

impl KernelThreadId {
    /// IDLE is the unique thread id for the idle thread.
    ///
    pub const IDLE: Self = KernelThreadId(0);

    /// Allocates and returns the next available KernelThreadId.
    ///
    fn new() -> Self {
        static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);
        KernelThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns a numerical representation for the thread
    /// ID.
    ///
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Resumes the referenced thread on the calling
    /// worker's machine.
    ///
    pub fn resume(&self) -> bool {
        current_machine().resume(*self)
    }
}

impl fmt::Display for KernelThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Describes the scheduling state of a thread.
///
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ThreadState {
    /// The thread is being created
    /// and not yet runnable.
    BeingCreated,

    /// The thread is runnable.
    Runnable,

    /// The thread is sleeping.
    Sleeping,

    /// The thread is in the process
    /// of exiting.
    Exiting,
}

/// Contains the metadata for a thread of
/// execution.
///
pub struct Thread {
    // This thread's unique id. The one exception
    // is the idle thread, where one instance exists
    // on each CPU. Every idle thread has the thread
    // id 0.
    id: KernelThreadId,

    // Used to name the thread's worker.
    name: String,

    // The thread's current state.
    state: AtomicCell<ThreadState>,

    // The CPU slot the thread owns, if any. This
    // is only ever granted to the thread by the
    // thread that gave up the slot.
    running_cpu: OwnerCell,

    // The thread's entry point, which is taken when
    // the thread first runs.
    entry: spin::Mutex<Option<ThreadEntry>>,

    // The host worker running the thread. This is
    // taken when the thread is reaped.
    worker: spin::Mutex<Option<Worker>>,
}

impl Thread {
    /// Creates the idle thread for `cpu`, to which we
    /// fall back if no other threads are runnable.
    ///
    pub(crate) fn new_idle(cpu: CpuId, running_cpu: OwnerCell) -> Arc<Thread> {
        // Note that we don't store the idle thread
        // in the thread table, as it never enters the
        // scheduler. This means we only run the idle
        // thread as a last resort.
        Arc::new(Thread {
            id: KernelThreadId::IDLE,
            name: format!("idle/{}", cpu.as_u32()),
            state: AtomicCell::new(ThreadState::Runnable),
            running_cpu,
            entry: spin::Mutex::new(None),
            worker: spin::Mutex::new(None),
        })
    }

    /// Creates a new kernel thread, marked as not
    /// runnable. The caller is responsible for
    /// starting its worker.
    ///
    pub(crate) fn new_kernel(name: &str, entry: ThreadEntry) -> Arc<Thread> {
        Arc::new(Thread {
            id: KernelThreadId::new(),
            name: name.to_string(),
            state: AtomicCell::new(ThreadState::BeingCreated),
            running_cpu: OwnerCell::new(),
            entry: spin::Mutex::new(Some(entry)),
            worker: spin::Mutex::new(None),
        })
    }

    /// Returns the thread's unique KernelThreadId.
    ///
    pub fn id(&self) -> KernelThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether this is a CPU's idle thread.
    ///
    pub fn is_idle(&self) -> bool {
        self.id == KernelThreadId::IDLE
    }

    /// Returns the thread's current scheduling state.
    ///
    pub fn thread_state(&self) -> ThreadState {
        self.state.load()
    }

    /// Updates the thread's state without touching the
    /// scheduler. Use [`Machine::set_state`] instead.
    ///
    pub(crate) fn store_state(&self, new_state: ThreadState) {
        self.state.store(new_state);
    }

    /// Returns the CPU the thread currently owns, if any.
    ///
    pub fn running_cpu(&self) -> Option<CpuId> {
        self.running_cpu.owner().and_then(CpuId::new)
    }

    pub(crate) fn cell(&self) -> &OwnerCell {
        &self.running_cpu
    }

    pub(crate) fn take_entry(&self) -> Option<ThreadEntry> {
        self.entry.lock().take()
    }

    pub(crate) fn set_worker(&self, worker: Worker) {
        *self.worker.lock() = Some(worker);
    }

    pub(crate) fn take_worker(&self) -> Option<Worker> {
        self.worker.lock().take()
    }

    /// Logs debug information about the thread.
    ///
    pub fn debug(&self) {
        match self.running_cpu() {
            Some(cpu) => info!(
                "thread {} ({}): {:?}, running on {}.",
                self.id, self.name, self.thread_state(), cpu
            ),
            None => info!(
                "thread {} ({}): {:?}, not running.",
                self.id,
                self.name,
                self.thread_state()
            ),
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.thread_state())
            .field("running_cpu", &self.running_cpu)
            .finish()
    }
}

impl Machine {
    /// Creates a new kernel thread and its worker,
    /// marking it as not runnable.
    ///
    /// The new thread will not start until [`resume`](Machine::resume)
    /// is called with its thread id.
    ///
    /// When the thread runs, it will start by enabling
    /// interrupts and calling `entry_point`.
    ///
    pub fn create_kernel_thread<F>(
        self: &Arc<Self>,
        name: &str,
        entry_point: F,
    ) -> Result<KernelThreadId, crate::Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let thread = Thread::new_kernel(name, Box::new(entry_point));
        let id = thread.id();
        self.threads.lock().insert(id, thread.clone());

        match self.spawn(&thread) {
            Ok(worker) => {
                thread.set_worker(worker);
                Ok(id)
            }
            Err(err) => {
                self.threads.lock().remove(&id);
                Err(err)
            }
        }
    }

    /// Creates a new kernel thread and its worker, and
    /// adds it to the scheduler.
    ///
    pub fn start_kernel_thread<F>(
        self: &Arc<Self>,
        name: &str,
        entry_point: F,
    ) -> Result<KernelThreadId, crate::Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.create_kernel_thread(name, entry_point)?;
        self.resume(id);

        Ok(id)
    }

    /// Puts the current thread to sleep and switches to
    /// the next runnable thread.
    ///
    /// # Panics
    ///
    /// `suspend` will panic if called by the idle thread.
    ///
    pub fn suspend(&self) {
        let current = self.current_thread();
        if current.is_idle() {
            panic!("idle thread tried to suspend");
        }

        self.set_state(&current, ThreadState::Sleeping);
        drop(current);

        self.switch();
    }

    /// Marks the current thread as exiting and gives up
    /// its CPU, without waiting to be scheduled again.
    ///
    pub(crate) fn exit_current(&self, current: &Arc<Thread>) {
        self.set_state(current, ThreadState::Exiting);
        self.reschedule(true);
    }
}
