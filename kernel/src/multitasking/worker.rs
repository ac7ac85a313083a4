// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Starts the host worker that runs each kernel thread.
//!
//! A worker's first action is to wait until its thread is granted a CPU.
//! It then runs the thread's entry point and, once that returns, exits the
//! thread, handing the CPU on to the next runnable thread.

use crate::thread::{ExitRequest, Thread};
use crate::{set_current_machine, Machine};
use cpu::CpuId;
use log::error;
use rendezvous::{fatal, Worker};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

impl Machine {
    /// Starts the worker for `thread`, which will block
    /// until the thread is first scheduled.
    ///
    pub(crate) fn spawn(self: &Arc<Self>, thread: &Arc<Thread>) -> Result<Worker, crate::Error> {
        let machine = self.clone();
        let worker_thread = thread.clone();
        let worker = self.substrate.spawn_worker(
            thread.name(),
            Box::new(move || machine.run(worker_thread)),
        )?;

        Ok(worker)
    }

    /// The body of every kernel thread's worker.
    ///
    fn run(self: Arc<Self>, thread: Arc<Thread>) {
        let slot = thread.cell().wait_until_owned(&*self.substrate);
        let cpu = match CpuId::new(slot) {
            Some(cpu) => cpu,
            None => fatal!("{} was granted invalid CPU {}", thread.name(), slot),
        };

        set_current_machine(Some(self.clone()));
        self.enter(cpu);
        self.finish_switch(cpu);

        // New threads start with interrupts enabled.
        self.interrupts.enable(cpu);

        let entry = match thread.take_entry() {
            Some(entry) => entry,
            None => fatal!("thread {} ({}) started twice", thread.id(), thread.name()),
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
            if !payload.is::<ExitRequest>() {
                error!(
                    "thread {} ({}) panicked: {}",
                    thread.id(),
                    thread.name(),
                    panic_message(&*payload)
                );
            }
        }

        self.exit_current(&thread);

        if let Some(slot) = thread.cell().owner() {
            fatal!(
                "worker for thread {} ({}) exiting while owning CPU {}",
                thread.id(),
                thread.name(),
                slot
            );
        }

        set_current_machine(None);
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic payload"
    }
}
