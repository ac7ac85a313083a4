// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Brings secondary CPUs online.
//!
//! Each secondary CPU gets an idle thread whose worker is created already
//! owning the CPU. The worker marks the CPU online, signals the CPU that
//! started it, and then runs the idle loop until the machine is halted.

use crate::thread::Thread;
use crate::{set_current_machine, Error, Machine};
use core::sync::atomic::Ordering;
use core::time::Duration;
use cpu::CpuId;
use log::{debug, info, warn};
use rendezvous::OwnerCell;
use std::sync::Arc;

impl Machine {
    /// Starts `cpu`, waiting up to `timeout` for it to
    /// come online.
    ///
    /// If `cpu` does not come online in time, it is told
    /// to stop, so it goes offline as soon as it starts.
    ///
    pub fn cpu_up(self: &Arc<Self>, cpu: CpuId, timeout: Duration) -> Result<(), Error> {
        if !self.cpus.is_present(cpu) {
            return Err(Error::NotPresent(cpu));
        }

        let per_cpu = self.per_cpu(cpu);
        let idle = Thread::new_idle(cpu, OwnerCell::owned_by(cpu.as_u32()));
        if !Arc::ptr_eq(per_cpu.idle.call_once(|| idle.clone()), &idle) {
            return Err(Error::AlreadyStarted(cpu));
        }

        *per_cpu.current.lock() = Some(idle.clone());

        let machine = self.clone();
        let worker_idle = idle.clone();
        let worker = self.substrate.spawn_worker(
            idle.name(),
            Box::new(move || machine.secondary_entry(worker_idle, cpu)),
        )?;
        idle.set_worker(worker);

        if !per_cpu.starting.wait_timeout(&*self.substrate, timeout) {
            per_cpu.stopping.store(true, Ordering::SeqCst);
            warn!("{} did not come online within {:?}.", cpu, timeout);
            return Err(Error::CpuStart(cpu));
        }

        info!("{} is online.", cpu);
        Ok(())
    }

    /// The body of each secondary CPU's idle worker.
    ///
    fn secondary_entry(self: Arc<Self>, idle: Arc<Thread>, cpu: CpuId) {
        idle.cell().wait_until_owned(&*self.substrate);
        set_current_machine(Some(self.clone()));
        self.enter(cpu);
        self.cpus.set_online(cpu);
        self.per_cpu(cpu).starting.complete(&*self.substrate);

        self.run_idle();

        debug!("{} idle worker finished.", cpu);
        set_current_machine(None);
    }

    /// Waits for the idle workers of every secondary CPU
    /// to finish, once the machine has been halted.
    ///
    pub fn join_cpus(&self) {
        for cpu in self.cpus.possible().iter() {
            if cpu == CpuId::BOOT {
                continue;
            }

            let worker = match self.per_cpu(cpu).idle.get() {
                Some(idle) => idle.take_worker(),
                None => None,
            };

            if let Some(worker) = worker {
                if !worker.join() {
                    warn!("idle worker for {} panicked.", cpu);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MachineConfig;
    use rendezvous::{AtomicWord, HostSubstrate, Substrate, WaitResult, Worker, WorkerEntry};
    use std::thread;

    /// Delays the start of each idle worker.
    ///
    struct SlowStart {
        host: HostSubstrate,
        delay: Duration,
    }

    impl Substrate for SlowStart {
        fn spawn_worker(
            &self,
            name: &str,
            entry: WorkerEntry,
        ) -> Result<Worker, rendezvous::Error> {
            if !name.starts_with("idle/") {
                return self.host.spawn_worker(name, entry);
            }

            let delay = self.delay;
            self.host.spawn_worker(
                name,
                Box::new(move || {
                    thread::sleep(delay);
                    entry();
                }),
            )
        }

        fn wait(
            &self,
            cell: &dyn AtomicWord,
            expected: u64,
            timeout: Option<Duration>,
        ) -> WaitResult {
            self.host.wait(cell, expected, timeout)
        }

        fn notify(&self, cell: &dyn AtomicWord, max_wake: u32) -> u32 {
            self.host.notify(cell, max_wake)
        }
    }

    #[test]
    fn late_cpu_stops_after_timeout() {
        let substrate = Arc::new(SlowStart {
            host: HostSubstrate::new(),
            delay: Duration::from_millis(200),
        });
        let machine = Machine::bootstrap(MachineConfig::new(2).with_substrate(substrate)).unwrap();
        let cpu1 = CpuId::new_unsafe(1);
        match machine.cpu_up(cpu1, Duration::from_millis(10)) {
            Err(Error::CpuStart(cpu)) => assert_eq!(cpu, cpu1),
            other => panic!("unexpected result: {:?}", other),
        }

        // CPU 1 is not online yet, so the halt does not
        // reach it. It stops by itself once it starts.
        assert!(!machine.cpus().is_online(cpu1));
        machine.halt();
        machine.run_idle();
        machine.join_cpus();

        assert!(!machine.cpus().is_online(cpu1));
        assert!(machine.idle_thread(cpu1).running_cpu().is_none());
        machine.detach();
    }

    #[test]
    fn start_errors() {
        let machine = Machine::bootstrap(MachineConfig::new(2)).unwrap();
        assert!(matches!(
            machine.cpu_up(CpuId::new_unsafe(5), Duration::from_secs(1)),
            Err(Error::NotPresent(_))
        ));
        assert!(matches!(
            machine.cpu_up(CpuId::BOOT, Duration::from_secs(1)),
            Err(Error::AlreadyStarted(_))
        ));

        machine.halt();
        machine.run_idle();
        machine.join_cpus();
        machine.detach();
    }
}
