// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Sends messages between CPUs.
//!
//! Each CPU has a set of pending [`IpiMessage`]s. Sending a message sets
//! its bit and raises [`IPI_IRQ`] on the target CPU, whose handler takes
//! every pending message at once:
//!
//! - [`RESCHEDULE`](IpiMessage::RESCHEDULE) asks the CPU to switch threads
//!   at its next opportunity.
//! - [`CPU_STOP`](IpiMessage::CPU_STOP) asks the CPU to go offline once it
//!   is idle.
//! - [`CALL_FUNC`](IpiMessage::CALL_FUNC) runs the functions queued with
//!   [`Machine::call_function_single`].
//! - [`IRQ_WORK`](IpiMessage::IRQ_WORK) runs the work a CPU deferred to
//!   itself with [`Machine::irq_work_queue`].
//!
//! A panic in a called function or in deferred work is logged, and the CPU
//! carries on handling its messages.

use crate::worker::panic_message;
use crate::{Error, Machine};
use bitflags::bitflags;
use core::fmt::Write;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use core::time::Duration;
use cpu::CpuId;
use interrupts::IPI_IRQ;
use log::error;
use rendezvous::Completion;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

bitflags! {
    /// The messages one CPU can send another.
    ///
    pub struct IpiMessage: u32 {
        const RESCHEDULE = 1 << 0;
        const CPU_STOP = 1 << 1;
        const CALL_FUNC = 1 << 2;
        const IRQ_WORK = 1 << 3;
    }
}

// Each message with its row label and description
// in the interrupt statistics.
const IPI_TYPES: [(IpiMessage, &str, &str); 4] = [
    (IpiMessage::RESCHEDULE, "RES", "Rescheduling interrupts"),
    (IpiMessage::CPU_STOP, "STP", "CPU stop interrupts"),
    (IpiMessage::CALL_FUNC, "CAL", "Function call interrupts"),
    (IpiMessage::IRQ_WORK, "IWI", "IRQ work interrupts"),
];

// How long a caller waits for a function call to
// complete before handling its own interrupts.
const CALL_POLL_INTERVAL: Duration = Duration::from_millis(10);

type Work = Box<dyn FnOnce() + Send>;

struct CallRequest {
    func: Work,
    done: Option<Arc<Completion>>,
}

/// The messages pending on a CPU.
///
pub(crate) struct IpiCpu {
    pending: AtomicU32,
    stats: [AtomicU64; 4],
    calls: spin::Mutex<VecDeque<CallRequest>>,

    // Work the CPU has deferred to its own IPI handler.
    irq_work: spin::Mutex<VecDeque<Work>>,
}

impl IpiCpu {
    pub(crate) fn new() -> Self {
        IpiCpu {
            pending: AtomicU32::new(0),
            stats: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
            calls: spin::Mutex::new(VecDeque::new()),
            irq_work: spin::Mutex::new(VecDeque::new()),
        }
    }
}

/// Installs the handler for [`IPI_IRQ`].
///
/// The handler holds a weak reference, so it does not
/// keep the machine alive.
///
pub(crate) fn init(machine: &Arc<Machine>) {
    let weak = Arc::downgrade(machine);
    machine.interrupts.register_irq(IPI_IRQ, move |cpu, _irq| {
        if let Some(machine) = weak.upgrade() {
            machine.handle_ipi(cpu);
        }
    });
}

impl Machine {
    /// Sends `msg` to `cpu`.
    ///
    pub fn send_ipi(&self, cpu: CpuId, msg: IpiMessage) {
        self.per_cpu(cpu)
            .ipi
            .pending
            .fetch_or(msg.bits(), Ordering::SeqCst);
        self.interrupts.trigger(cpu, IPI_IRQ);
    }

    /// Handles every message pending on `cpu`.
    ///
    fn handle_ipi(&self, cpu: CpuId) {
        let per_cpu = self.per_cpu(cpu);
        loop {
            let bits = per_cpu.ipi.pending.swap(0, Ordering::SeqCst);
            if bits == 0 {
                return;
            }

            let msgs = IpiMessage::from_bits_truncate(bits);
            for (i, (msg, _, _)) in IPI_TYPES.iter().enumerate() {
                if msgs.contains(*msg) {
                    per_cpu.ipi.stats[i].fetch_add(1, Ordering::Relaxed);
                }
            }

            if msgs.contains(IpiMessage::RESCHEDULE) {
                per_cpu.need_resched.store(true, Ordering::SeqCst);
            }

            if msgs.contains(IpiMessage::CPU_STOP) {
                per_cpu.stopping.store(true, Ordering::SeqCst);
            }

            if msgs.contains(IpiMessage::CALL_FUNC) {
                self.run_calls(cpu);
            }

            if msgs.contains(IpiMessage::IRQ_WORK) {
                self.run_irq_work(cpu);
            }
        }
    }

    fn run_calls(&self, cpu: CpuId) {
        loop {
            let request = self.per_cpu(cpu).ipi.calls.lock().pop_front();
            let request = match request {
                Some(request) => request,
                None => return,
            };

            run_contained(cpu, "function call", request.func);
            if let Some(done) = request.done {
                done.complete(&*self.substrate);
            }
        }
    }

    fn run_irq_work(&self, cpu: CpuId) {
        let work: Vec<Work> = self.per_cpu(cpu).ipi.irq_work.lock().drain(..).collect();
        for func in work {
            run_contained(cpu, "IRQ work", func);
        }
    }

    /// Defers `func` to the calling CPU's IPI handler.
    ///
    /// `func` runs with interrupts disabled, the next time
    /// the calling CPU handles interrupts. Deferred work
    /// always runs on the CPU that queued it.
    ///
    /// # Panics
    ///
    /// `irq_work_queue` panics if the caller is not running
    /// as a CPU.
    ///
    pub fn irq_work_queue<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let cpu = match cpu::try_id() {
            Some(cpu) => cpu,
            None => panic!("irq work queued from outside any CPU"),
        };

        self.per_cpu(cpu).ipi.irq_work.lock().push_back(Box::new(func));
        self.send_ipi(cpu, IpiMessage::IRQ_WORK);
    }

    /// Runs `func` on `cpu`, with interrupts disabled.
    ///
    /// If `wait` is set, `call_function_single` returns once
    /// `func` has finished. While waiting, the caller keeps
    /// handling its own interrupts, so two CPUs can call
    /// functions on each other.
    ///
    pub fn call_function_single<F>(&self, cpu: CpuId, func: F, wait: bool) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.cpus.is_online(cpu) {
            return Err(Error::NotOnline(cpu));
        }

        let this_cpu = cpu::try_id();
        if this_cpu == Some(cpu) {
            let flags = self.interrupts.save(cpu);
            func();
            self.interrupts.restore(cpu, flags);
            return Ok(());
        }

        let done = if wait {
            Some(Arc::new(Completion::new()))
        } else {
            None
        };

        self.per_cpu(cpu).ipi.calls.lock().push_back(CallRequest {
            func: Box::new(func),
            done: done.clone(),
        });
        self.send_ipi(cpu, IpiMessage::CALL_FUNC);

        let done = match done {
            Some(done) => done,
            None => return Ok(()),
        };

        while !done.wait_timeout(&*self.substrate, CALL_POLL_INTERVAL) {
            if let Some(this_cpu) = this_cpu {
                if self.interrupts.is_enabled(this_cpu) {
                    self.interrupts.enable(this_cpu);
                }
            }

            if !self.cpus.is_online(cpu) && !done.try_wait() {
                return Err(Error::NotOnline(cpu));
            }
        }

        Ok(())
    }

    /// Describes each online CPU, as reported by the CPU
    /// itself.
    ///
    pub fn cpuinfo(&self) -> Result<String, Error> {
        let mut out = String::new();
        for cpu in self.cpus.online().iter() {
            let info = Arc::new(spin::Mutex::new(String::new()));
            let report = info.clone();
            self.call_function_single(
                cpu,
                move || {
                    let machine = crate::current_machine();
                    let this_cpu = cpu::id();
                    let current = machine.current_thread();
                    let mut report = report.lock();
                    let _ = writeln!(report, "processor\t: {}", this_cpu.as_u32());
                    let _ = writeln!(report, "current\t\t: {}", current.name());
                    let _ = writeln!(
                        report,
                        "tls block\t: {:?}",
                        machine.tls.block_base(this_cpu)
                    );
                },
                true,
            )?;

            out.push_str(&info.lock());
            out.push('\n');
        }

        Ok(out)
    }

    /// Returns the number of times `cpu` has received any
    /// of the messages in `msgs`.
    ///
    pub fn ipi_count(&self, cpu: CpuId, msgs: IpiMessage) -> u64 {
        let ipi = &self.per_cpu(cpu).ipi;
        IPI_TYPES
            .iter()
            .enumerate()
            .filter(|(_, (msg, _, _))| msgs.contains(*msg))
            .map(|(i, _)| ipi.stats[i].load(Ordering::Relaxed))
            .sum()
    }

    /// Renders the interrupt counts for each online CPU,
    /// followed by the message counts.
    ///
    pub fn show_interrupts(&self) -> String {
        let cpus: Vec<CpuId> = self.cpus.online().iter().collect();
        let mut out = self.interrupts.show_interrupts(&cpus);
        for (msg, label, description) in IPI_TYPES.iter() {
            let _ = write!(out, "{}:", label);
            for cpu in cpus.iter() {
                let _ = write!(out, " {:>10}", self.ipi_count(*cpu, *msg));
            }

            let _ = writeln!(out, "  {}", description);
        }

        out
    }
}

// Runs work from the IPI handler, logging rather
// than unwinding out of it if the work panics.
fn run_contained(cpu: CpuId, what: &str, func: Work) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(func)) {
        error!("{} on {} panicked: {}", what, cpu, panic_message(&*payload));
    }
}
