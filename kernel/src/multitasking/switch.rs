// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! switch contains the functionality to switch between threads.
//!
//! A CPU is handed from one thread to the next by releasing it from the
//! outgoing thread's cell, granting it to the incoming thread's cell, and
//! waking the incoming thread's worker. The outgoing worker then blocks
//! until some CPU is granted back to it, which may not be the CPU it gave
//! up.
//!
//! The CPU's previous occupant is recorded so that the incoming thread can
//! finish the switch on its side, which includes reaping the outgoing
//! thread if it was exiting.

use crate::scheduler::Scheduler;
use crate::thread::{Thread, ThreadState};
use crate::{Machine, PerCpu};
use core::sync::atomic::Ordering;
use cpu::CpuId;
use log::{trace, warn};
use rendezvous::fatal;
use std::sync::Arc;

impl Machine {
    /// Schedules out the current thread and hands its CPU
    /// to the next runnable thread, or to the CPU's idle
    /// thread.
    ///
    /// If `exiting` is set, the current thread will never
    /// run again, so `reschedule` returns as soon as the
    /// CPU has been handed over. Otherwise, it returns
    /// once the thread has been granted a CPU again.
    ///
    pub(crate) fn reschedule(&self, exiting: bool) {
        let cpu = cpu::id();
        let per_cpu = self.per_cpu(cpu);
        per_cpu.need_resched.store(false, Ordering::SeqCst);
        let flags = self.interrupts.save(cpu);

        let mut scheduler = self.scheduler.lock();
        let current = match per_cpu.current.lock().clone() {
            Some(current) => current,
            None => fatal!("{} rescheduled with no current thread", cpu),
        };

        // Add the current thread to the runnable
        // queue, unless it's the idle thread, which
        // never enters the scheduler.
        if !current.is_idle() && current.thread_state() == ThreadState::Runnable {
            scheduler.add(current.id());
        }

        let next = self.pick_next(&mut scheduler, cpu);
        if Arc::ptr_eq(&current, &next) {
            // We're already running the right
            // thread, so return without doing
            // anything further.
            drop(scheduler);
            self.interrupts.restore(cpu, flags);
            return;
        }

        trace!("{}: switching from {} to {}.", cpu, current.name(), next.name());
        self.leave();
        self.switch_to(per_cpu, cpu, current.clone(), next.clone());
        drop(scheduler);

        next.cell().notify(&*self.substrate);
        drop(next);

        if exiting {
            return;
        }

        // We now wait until we are granted a CPU, then
        // carry on where we left off.
        let slot = current.cell().wait_until_owned(&*self.substrate);
        let cpu = match CpuId::new(slot) {
            Some(cpu) => cpu,
            None => fatal!("{} was granted invalid CPU {}", current.name(), slot),
        };

        drop(current);
        self.enter(cpu);
        self.finish_switch(cpu);
        self.interrupts.restore(cpu, flags);
    }

    /// Returns the next thread to run on `cpu`, skipping
    /// threads that have exited or stopped being runnable
    /// since they were queued.
    ///
    fn pick_next(&self, scheduler: &mut Scheduler, cpu: CpuId) -> Arc<Thread> {
        let threads = self.threads.lock();
        while let Some(id) = scheduler.next() {
            match threads.get(&id) {
                Some(thread) if thread.thread_state() == ThreadState::Runnable => {
                    return thread.clone();
                }
                _ => continue,
            }
        }

        drop(threads);
        self.idle_thread(cpu)
    }

    /// Hands `cpu` from `from` to `to`.
    ///
    /// This must be called with the scheduler lock held.
    /// The caller must then notify `to` once the lock is
    /// released.
    ///
    fn switch_to(&self, per_cpu: &PerCpu, cpu: CpuId, from: Arc<Thread>, to: Arc<Thread>) {
        let slot = from.cell().release();
        if slot != cpu.as_u32() {
            fatal!("{} released CPU {} while running on {}", from.name(), slot, cpu);
        }

        *per_cpu.previous.lock() = Some(from);
        *per_cpu.current.lock() = Some(to.clone());
        to.cell().grant(slot);
    }

    /// Completes a switch on the thread that has just been
    /// granted `cpu`, reaping the previous occupant if it
    /// was exiting.
    ///
    pub(crate) fn finish_switch(&self, cpu: CpuId) {
        let previous = self.per_cpu(cpu).previous.lock().take();
        if let Some(previous) = previous {
            if previous.thread_state() == ThreadState::Exiting {
                self.reap(previous);
            }
        }
    }

    /// Removes an exited thread from the thread table and
    /// waits for its worker to terminate.
    ///
    fn reap(&self, thread: Arc<Thread>) {
        self.threads.lock().remove(&thread.id());
        if let Some(worker) = thread.take_worker() {
            if !worker.join() {
                warn!("worker for thread {} ({}) panicked.", thread.id(), thread.name());
            }
        }

        trace!("reaped thread {} ({}).", thread.id(), thread.name());
    }
}
