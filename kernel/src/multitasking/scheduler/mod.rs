// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements a simple round robin scheduler for threads.
//!
//! ## Thread switching
//!
//! [`switch`] can be called to proactively switch to the next available
//! thread in the scheduler. If no other threads are runnable, the CPU's
//! idle thread runs instead.
//!
//! [`cond_resched`] handles any pending interrupts, then switches only if
//! this CPU has been asked to reschedule or other threads are waiting.
//!
//! ## Idling
//!
//! Each CPU's idle thread runs [`Machine::idle_loop`], which waits for
//! interrupts while there is nothing to run, and takes the CPU offline once
//! the machine is halted.

use crate::ipi::IpiMessage;
use crate::thread::{KernelThreadId, Thread, ThreadState};
use crate::worker::panic_message;
use crate::{current_machine, Machine};
use core::sync::atomic::Ordering;
use cpu::CpuId;
use log::{debug, error, warn};
use rendezvous::fatal;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Scheduler is a basic thread scheduler.
///
/// Currently, it implements a round-robin algorithm.
///
pub struct Scheduler {
    runnable: VecDeque<KernelThreadId>,
}

impl Scheduler {
    pub(crate) fn new() -> Scheduler {
        Scheduler {
            runnable: VecDeque::new(),
        }
    }

    /// add queues a thread onto the runnable queue.
    ///
    pub fn add(&mut self, thread: KernelThreadId) {
        self.runnable.push_back(thread);
    }

    /// next returns the next thread able to run.
    ///
    /// The thread is removed from the runnable queue,
    /// so it must be added again afterwards if still
    /// able to run.
    ///
    pub fn next(&mut self) -> Option<KernelThreadId> {
        self.runnable.pop_front()
    }

    /// remove removes the thread from the queue.
    ///
    pub fn remove(&mut self, thread: KernelThreadId) {
        self.runnable.retain(|id| *id != thread);
    }

    pub fn len(&self) -> usize {
        self.runnable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runnable.is_empty()
    }
}

/// Schedules out the current thread and switches to the next
/// runnable thread.
///
/// If no other threads are ready to run, `switch` may return
/// immediately.
///
pub fn switch() {
    current_machine().switch();
}

/// Resumes the thread with the given id on the calling
/// worker's machine.
///
/// `resume` returns whether the thread is now runnable.
///
pub fn resume(thread_id: KernelThreadId) -> bool {
    current_machine().resume(thread_id)
}

/// Handles pending interrupts, then switches to another thread
/// if this CPU has been asked to reschedule or other threads are
/// waiting to run.
///
pub fn cond_resched() {
    current_machine().cond_resched();
}

impl Machine {
    /// Updates the thread's state, adding it to or removing
    /// it from the run queue as needed.
    ///
    /// A thread that still owns a CPU is not queued. It is
    /// queued by its own switch instead, once it has released
    /// the CPU.
    ///
    pub fn set_state(&self, thread: &Arc<Thread>, new_state: ThreadState) {
        let mut scheduler = self.scheduler.lock();
        let prev_state = thread.thread_state();
        thread.store_state(new_state);

        if thread.is_idle() || prev_state == new_state {
            return;
        }

        if new_state == ThreadState::Runnable {
            if !thread.cell().is_owned() {
                scheduler.add(thread.id());
            }
        } else if prev_state == ThreadState::Runnable {
            scheduler.remove(thread.id());
        }
    }

    /// Makes the thread with the given id runnable.
    ///
    /// `resume` returns true if the thread is now runnable,
    /// or false if it has exited or does not exist. If the
    /// thread was queued, an idle CPU is woken to run it.
    ///
    pub fn resume(&self, thread_id: KernelThreadId) -> bool {
        let queued = {
            let mut scheduler = self.scheduler.lock();
            let thread = match self.threads.lock().get(&thread_id) {
                Some(thread) => thread.clone(),
                None => return false,
            };

            match thread.thread_state() {
                ThreadState::Runnable => return true,
                ThreadState::Exiting => return false,
                ThreadState::BeingCreated | ThreadState::Sleeping => {
                    thread.store_state(ThreadState::Runnable);
                    if thread.cell().is_owned() {
                        false
                    } else {
                        scheduler.add(thread_id);
                        true
                    }
                }
            }
        };

        if queued {
            self.kick_idle_cpu();
        }

        true
    }

    /// Asks one other online CPU that is idling to look
    /// for work.
    ///
    fn kick_idle_cpu(&self) {
        let this_cpu = cpu::try_id();
        for cpu in self.cpus.online().iter() {
            if Some(cpu) == this_cpu {
                continue;
            }

            let idle = match self.per_cpu(cpu).current.lock().as_ref() {
                Some(current) => current.is_idle(),
                None => false,
            };

            if idle {
                self.send_ipi(cpu, IpiMessage::RESCHEDULE);
                return;
            }
        }
    }

    /// Schedules out the current thread and switches to the
    /// next runnable thread.
    ///
    pub fn switch(&self) {
        self.reschedule(false);
    }

    /// Handles pending interrupts, then switches if this CPU
    /// needs to reschedule or other threads are waiting.
    ///
    pub fn cond_resched(&self) {
        let cpu = cpu::id();
        if self.interrupts.is_enabled(cpu) {
            self.interrupts.enable(cpu);
        }

        let per_cpu = self.per_cpu(cpu);
        if per_cpu.need_resched.load(Ordering::SeqCst) || !self.scheduler.lock().is_empty() {
            self.switch();
        }
    }

    /// Runs the idle loop on the calling worker, which
    /// must own a CPU as its idle thread.
    ///
    /// `run_idle` returns once the CPU has gone offline.
    /// If the idle loop panics, the panic is logged, and
    /// the process is aborted if the CPU is still owned.
    ///
    pub fn run_idle(&self) {
        let cpu = cpu::id();
        let idle = self.idle_thread(cpu);
        self.interrupts.enable(cpu);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.idle_loop())) {
            error!("idle thread for {} panicked: {}", cpu, panic_message(&*payload));
        }

        if let Some(slot) = idle.cell().owner() {
            fatal!("idle worker for {} exiting while owning CPU {}", cpu, slot);
        }
    }

    /// Implements the idle thread.
    ///
    /// We fall back to this if the kernel has no other
    /// work left to do. The loop returns once the CPU
    /// has been stopped.
    ///
    pub(crate) fn idle_loop(&self) {
        loop {
            let cpu = cpu::id();
            let per_cpu = self.per_cpu(cpu);
            if per_cpu.need_resched.load(Ordering::SeqCst) || !self.scheduler.lock().is_empty() {
                self.switch();
                continue;
            }

            if per_cpu.stopping.load(Ordering::SeqCst) {
                self.stop_cpu(cpu);
                return;
            }

            self.interrupts.idle(cpu);
            self.interrupts.enable(cpu);
        }
    }

    /// Takes the calling idle thread's CPU offline,
    /// releasing the CPU.
    ///
    fn stop_cpu(&self, cpu: CpuId) {
        let scheduler = self.scheduler.lock();
        let per_cpu = self.per_cpu(cpu);
        self.interrupts.disable(cpu);
        self.cpus.set_offline(cpu);
        self.leave();
        self.idle_thread(cpu).cell().release();
        *per_cpu.current.lock() = None;

        if !scheduler.is_empty() {
            warn!(
                "{} stopped with {} runnable threads queued.",
                cpu,
                scheduler.len()
            );
        }

        debug!("{} is offline.", cpu);
    }

    /// Stops every online CPU.
    ///
    /// Each CPU goes offline the next time its idle
    /// thread runs, so runnable threads finish first.
    ///
    pub fn halt(&self) {
        for cpu in self.cpus.online().iter() {
            self.per_cpu(cpu).stopping.store(true, Ordering::SeqCst);
            self.send_ipi(cpu, IpiMessage::CPU_STOP);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MachineConfig;
    use core::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex;

    #[test]
    fn round_robin() {
        let mut scheduler = Scheduler::new();
        let a = KernelThreadId::IDLE;
        assert!(scheduler.is_empty());
        scheduler.add(a);
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.next(), Some(a));
        assert_eq!(scheduler.next(), None);

        scheduler.add(a);
        scheduler.remove(a);
        assert!(scheduler.is_empty());
    }

    // Runs the machine's idle loop on the calling test
    // thread until every CPU has been halted.
    //
    fn run(machine: Arc<Machine>) {
        machine.run_idle();
        machine.join_cpus();
        machine.detach();
    }

    #[test]
    fn switch_hands_over_the_cpu() {
        // Two possible CPUs, with only the boot CPU
        // online, so the threads share CPU 0.
        let machine = Machine::bootstrap(MachineConfig::new(2)).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));

        let b_events = events.clone();
        let b = machine
            .create_kernel_thread("b", move || {
                let thread = current_machine().current_thread();
                b_events
                    .lock()
                    .unwrap()
                    .push(("b running", thread.running_cpu()));
            })
            .unwrap();

        let a_events = events.clone();
        machine
            .start_kernel_thread("a", move || {
                let machine = current_machine();
                let me = machine.current_thread();
                a_events
                    .lock()
                    .unwrap()
                    .push(("a running", me.running_cpu()));

                // B must run on our CPU before we return
                // from the switch.
                machine.resume(b);
                machine.switch();

                a_events
                    .lock()
                    .unwrap()
                    .push(("a resumed", me.running_cpu()));
                current_machine().halt();
            })
            .unwrap();

        run(machine.clone());

        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                ("a running", Some(CpuId::BOOT)),
                ("b running", Some(CpuId::BOOT)),
                ("a resumed", Some(CpuId::BOOT)),
            ]
        );
        assert_eq!(machine.num_threads(), 0);
    }

    #[test]
    fn suspend_and_resume() {
        let machine = Machine::bootstrap(MachineConfig::new(1)).unwrap();
        let woken = Arc::new(AtomicBool::new(false));
        let steps = Arc::new(AtomicUsize::new(0));

        let sleeper_woken = woken.clone();
        let sleeper_steps = steps.clone();
        let sleeper = machine
            .start_kernel_thread("sleeper", move || {
                sleeper_steps.fetch_add(1, Ordering::SeqCst);
                crate::thread::suspend();
                assert!(sleeper_woken.load(Ordering::SeqCst));
                sleeper_steps.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let waker_woken = woken.clone();
        let waker_steps = steps.clone();
        machine
            .start_kernel_thread("waker", move || {
                let machine = current_machine();

                // Let the sleeper go to sleep.
                while machine
                    .thread(sleeper)
                    .map(|t| t.thread_state() != ThreadState::Sleeping)
                    .unwrap_or(false)
                {
                    switch();
                }

                assert_eq!(waker_steps.load(Ordering::SeqCst), 1);
                waker_woken.store(true, Ordering::SeqCst);
                assert!(resume(sleeper));

                // Wait for the sleeper to finish.
                while machine.thread(sleeper).is_some() {
                    switch();
                }

                assert_eq!(waker_steps.load(Ordering::SeqCst), 2);
                machine.halt();
            })
            .unwrap();

        run(machine.clone());
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert!(!machine.resume(sleeper));
    }
}
