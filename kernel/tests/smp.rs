// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

// Boots whole machines on the test threads and checks
// how threads share the CPUs.

use cpu::{CpuId, MAX_CPUS};
use kernel::Config;
use multitasking::ipi::IpiMessage;
use multitasking::thread::ThreadState;
use multitasking::{current_machine, scheduler};
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tls::TlsLayout;

// Idle CPUs sleep until an interrupt arrives, so a
// lost wakeup hangs the test.
fn config(cpus: usize) -> Config {
    config_with_idle_timeout(cpus, None)
}

fn config_with_idle_timeout(cpus: usize, idle_timeout_ms: Option<u64>) -> Config {
    let _ = env_logger::builder().is_test(true).try_init();
    Config {
        cpus,
        idle_timeout_ms,
        ..Config::default()
    }
}

// Counts how many threads are inside the critical
// section on each CPU, and whether any CPU has ever
// had more than one.
//
struct Occupancy {
    inside: Vec<AtomicU32>,
    violations: AtomicU64,
    rounds: AtomicU64,
}

impl Occupancy {
    fn new() -> Self {
        Occupancy {
            inside: (0..MAX_CPUS).map(|_| AtomicU32::new(0)).collect(),
            violations: AtomicU64::new(0),
            rounds: AtomicU64::new(0),
        }
    }

    fn round(&self) {
        let cpu = cpu::id();
        let inside = &self.inside[cpu.as_usize()];
        if inside.fetch_add(1, Ordering::SeqCst) != 0 {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }

        // Give another worker the chance to run here
        // if the handoff were broken.
        std::thread::yield_now();
        if cpu::id() != cpu {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }

        inside.fetch_sub(1, Ordering::SeqCst);
        self.rounds.fetch_add(1, Ordering::SeqCst);
    }
}

fn stress(
    config: &Config,
    threads: usize,
    rounds: usize,
    plan: Vec<bool>,
) -> Arc<Occupancy> {
    let occupancy = Arc::new(Occupancy::new());
    let init_occupancy = occupancy.clone();
    let plan = Arc::new(plan);
    kernel::boot(config, move || {
        let machine = current_machine();
        let mut ids = Vec::new();
        for i in 0..threads {
            let occupancy = init_occupancy.clone();
            let plan = plan.clone();
            let id = machine
                .start_kernel_thread(&format!("stress/{}", i), move || {
                    for round in 0..rounds {
                        occupancy.round();
                        if plan[(i + round) % plan.len()] {
                            scheduler::switch();
                        } else {
                            scheduler::cond_resched();
                        }
                    }
                })
                .unwrap();
            ids.push(id);
        }

        while ids.iter().any(|id| machine.thread(*id).is_some()) {
            scheduler::switch();
        }

        kernel::halt();
    })
    .unwrap();

    occupancy
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn mutual_exclusion(
        cpus in 1usize..=4,
        threads in 1usize..=6,
        rounds in 1usize..=20,
        plan in prop::collection::vec(any::<bool>(), 1..8),
        idle_timeout_ms in prop::option::of(1u64..30),
    ) {
        let config = config_with_idle_timeout(cpus, idle_timeout_ms);
        let occupancy = stress(&config, threads, rounds, plan);
        prop_assert_eq!(occupancy.violations.load(Ordering::SeqCst), 0);
        prop_assert_eq!(
            occupancy.rounds.load(Ordering::SeqCst),
            (threads * rounds) as u64
        );
    }
}

#[test]
fn stress_without_idle_timeout() {
    for cpus in 1..=4 {
        let occupancy = stress(&config(cpus), 6, 20, vec![true, false, false]);
        assert_eq!(occupancy.violations.load(Ordering::SeqCst), 0);
        assert_eq!(occupancy.rounds.load(Ordering::SeqCst), 6 * 20);
    }
}

#[test]
fn tls_survives_thread_exit() {
    let mut layout = TlsLayout::empty();
    let counter = layout.reserve(7u64);
    let observed = Arc::new(Mutex::new(Vec::new()));
    let reaped = Arc::new(AtomicBool::new(false));

    let init_observed = observed.clone();
    let init_reaped = reaped.clone();
    kernel::boot_with_tls(&config(1), layout, move || {
        let machine = current_machine();

        let writer_observed = init_observed.clone();
        let writer = machine
            .start_kernel_thread("writer", move || {
                writer_observed.lock().unwrap().push(counter.get());
                counter.set(42);
            })
            .unwrap();

        let handle = machine.thread(writer).unwrap();
        while machine.thread(writer).is_some() {
            scheduler::switch();
        }

        // The writer's worker has been joined and it
        // no longer owns a CPU.
        init_reaped.store(
            handle.thread_state() == ThreadState::Exiting && handle.running_cpu().is_none(),
            Ordering::SeqCst,
        );

        let reader_observed = init_observed.clone();
        let reader = machine
            .start_kernel_thread("reader", move || {
                reader_observed.lock().unwrap().push(counter.get());
            })
            .unwrap();

        while machine.thread(reader).is_some() {
            scheduler::switch();
        }

        kernel::halt();
    })
    .unwrap();

    assert_eq!(*observed.lock().unwrap(), vec![7, 42]);
    assert!(reaped.load(Ordering::SeqCst));
}

#[test]
fn cpuinfo_and_interrupts() {
    let report = Arc::new(Mutex::new(None));
    let init_report = report.clone();
    kernel::boot(&config(2), move || {
        let machine = current_machine();
        let info = machine.cpuinfo().unwrap();
        let interrupts = machine.show_interrupts();
        let calls: u64 = machine
            .cpus()
            .online()
            .iter()
            .map(|cpu| machine.ipi_count(cpu, IpiMessage::CALL_FUNC))
            .sum();

        *init_report.lock().unwrap() = Some((info, interrupts, calls));
        kernel::halt();
    })
    .unwrap();

    let (info, interrupts, calls) = report.lock().unwrap().take().unwrap();
    assert!(info.contains("processor\t: 0"));
    assert!(info.contains("processor\t: 1"));
    assert!(interrupts.contains("Function call interrupts"));
    assert!(interrupts.contains("CPU0"));
    assert!(interrupts.contains("CPU1"));
    assert!(calls >= 1);
}

#[test]
fn device_interrupt_wakes_idle_cpu() {
    let target = CpuId::new_unsafe(1);
    let handled = Arc::new(Mutex::new(Vec::new()));
    let counts = Arc::new(AtomicU64::new(0));

    let init_handled = handled.clone();
    let init_counts = counts.clone();
    kernel::boot(&config(2), move || {
        let machine = current_machine();
        let line = machine.interrupts().alloc_irq().unwrap();
        let handler_log = init_handled.clone();
        machine.interrupts().register_irq(line, move |cpu, irq| {
            handler_log.lock().unwrap().push((cpu, irq));
        });

        // The device runs outside the kernel.
        let device_machine = machine.clone();
        let device = std::thread::spawn(move || {
            device_machine.interrupts().trigger(target, line);
        });
        device.join().unwrap();

        while init_handled.lock().unwrap().is_empty() {
            scheduler::cond_resched();
        }

        init_counts.store(machine.interrupts().count(target, line), Ordering::SeqCst);
        machine.interrupts().free_irq(line);
        kernel::halt();
    })
    .unwrap();

    let handled = handled.lock().unwrap();
    assert_eq!(handled.len(), 1);
    assert_eq!(handled[0].0, target);
    assert_eq!(counts.load(Ordering::SeqCst), 1);
}

#[test]
fn panicking_call_leaves_cpu_running() {
    let report = Arc::new(Mutex::new(None));
    let init_report = report.clone();
    kernel::boot(&config(2), move || {
        let machine = current_machine();
        let this_cpu = cpu::id();
        let target = machine
            .cpus()
            .online()
            .iter()
            .find(|cpu| *cpu != this_cpu)
            .unwrap();

        let failed = machine.call_function_single(target, || panic!("call failed"), true);

        let ran = Arc::new(AtomicBool::new(false));
        let call_ran = ran.clone();
        let again = machine.call_function_single(
            target,
            move || call_ran.store(true, Ordering::SeqCst),
            true,
        );

        let info = machine.cpuinfo().unwrap();
        *init_report.lock().unwrap() = Some((
            target,
            failed.is_ok(),
            again.is_ok() && ran.load(Ordering::SeqCst),
            info,
        ));
        kernel::halt();
    })
    .unwrap();

    let (target, failed, again, info) = report.lock().unwrap().take().unwrap();
    assert!(failed);
    assert!(again);
    assert!(info.contains(&format!("processor\t: {}", target.as_u32())));
}

#[test]
fn irq_work_runs_on_queueing_cpu() {
    let report = Arc::new(Mutex::new(None));
    let init_report = report.clone();
    kernel::boot(&config(2), move || {
        let machine = current_machine();
        let this_cpu = cpu::id();
        let ran_on = Arc::new(Mutex::new(None));

        // The work waits until interrupts are enabled.
        let flags = machine.interrupts().save(this_cpu);
        let work_ran_on = ran_on.clone();
        machine.irq_work_queue(move || {
            *work_ran_on.lock().unwrap() = Some(cpu::id());
        });
        let early = ran_on.lock().unwrap().is_some();
        machine.interrupts().restore(this_cpu, flags);
        let ran_on = *ran_on.lock().unwrap();

        *init_report.lock().unwrap() = Some((
            this_cpu,
            early,
            ran_on,
            machine.ipi_count(this_cpu, IpiMessage::IRQ_WORK),
            machine.show_interrupts(),
        ));
        kernel::halt();
    })
    .unwrap();

    let (cpu, early, ran_on, count, interrupts) = report.lock().unwrap().take().unwrap();
    assert!(!early);
    assert_eq!(ran_on, Some(cpu));
    assert_eq!(count, 1);
    assert!(interrupts.contains("IRQ work interrupts"));
}

#[test]
fn boot_twice_on_one_thread() {
    for cpus in 1..=2 {
        let ran = Arc::new(AtomicBool::new(false));
        let init_ran = ran.clone();
        kernel::boot(&config(cpus), move || {
            init_ran.store(true, Ordering::SeqCst);
            kernel::halt();
        })
        .unwrap();

        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(cpu::try_id(), None);
    }
}
