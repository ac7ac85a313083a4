// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

// This is the entry point for the kernel, which
// reads the optional configuration file named in
// its arguments, then boots the kernel with kmain
// as its initial thread.

use kernel::Config;
use log::{error, info};
use multitasking::{current_machine, scheduler, thread};
use std::path::Path;
use std::process;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => match Config::load(Path::new(&path)) {
            Ok(config) => config,
            Err(err) => {
                error!("{}", err);
                process::exit(1);
            }
        },
        None => Config::default(),
    };

    info!("Kernel booting...");
    if let Err(err) = kernel::boot(&config, kmain) {
        error!("{}", err);
        process::exit(1);
    }
}

// kmain is the kernel's initial thread. It starts
// a few worker threads, reports on the machine, and
// then halts the kernel once they have finished.
//
fn kmain() {
    let machine = current_machine();
    info!("Kernel ready!");

    let mut workers = Vec::new();
    for i in 0..4 {
        let name = format!("worker/{}", i);
        match machine.start_kernel_thread(&name, move || {
            for _ in 0..3 {
                thread::debug();
                scheduler::cond_resched();
            }
        }) {
            Ok(id) => workers.push(id),
            Err(err) => error!("failed to start {}: {}", name, err),
        }
    }

    // Wait for the workers to finish.
    while workers.iter().any(|id| machine.thread(*id).is_some()) {
        scheduler::switch();
    }

    match machine.cpuinfo() {
        Ok(info) => info!("CPU info:\n{}", info),
        Err(err) => error!("failed to read CPU info: {}", err),
    }

    info!("Interrupts:\n{}", machine.show_interrupts());

    kernel::halt();
}
