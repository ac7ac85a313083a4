// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! kernel implements the Firefly kernel on host threads.
//!
//! This module covers the initialisation that must always happen when
//! the kernel starts, and the shutdown that follows once the kernel has
//! been halted.
//!
//! [`boot`] is called when the kernel starts. The calling thread becomes
//! the boot CPU, each secondary CPU is brought online, and the `init`
//! function is started as the first kernel thread. `boot` then runs the
//! boot CPU's idle loop, returning once [`halt`] has been called and every
//! CPU has gone offline.
//!
//! # Kernel subsystems
//!
//! Several parts of kernel functionality are provided
//! in separate crates. These are:
//!
//! - [cpu](::cpu)
//! - interrupts
//! - [memory/tls](::tls)
//! - [multitasking](::multitasking)
//! - utils/rendezvous

pub mod config;

use core::time::Duration;
use cpu::CpuId;
use log::{info, warn};
use multitasking::Machine;
use std::path::PathBuf;
use std::sync::Arc;
use tls::TlsLayout;

pub use config::Config;

/// Describes an error encountered while booting
/// the kernel.
///
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configuration could not be parsed.
    ///
    #[error("failed to parse configuration: {0}")]
    Config(#[from] toml::de::Error),

    /// The configuration was parsed, but is not
    /// usable.
    ///
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// The configuration file could not be read.
    ///
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TLS layout is not valid.
    ///
    #[error(transparent)]
    Tls(#[from] tls::Error),

    /// The machine could not be started.
    ///
    #[error(transparent)]
    Multitasking(#[from] multitasking::Error),
}

/// Boots the kernel on the calling thread, running
/// `init` as the first kernel thread.
///
/// `boot` returns once the kernel has been halted.
///
pub fn boot<F>(config: &Config, init: F) -> Result<(), Error>
where
    F: FnOnce() + Send + 'static,
{
    boot_with_tls(config, config.tls_layout()?, init)
}

/// Like [`boot`], but with a TLS layout prepared by
/// the caller, such as one with reserved variables.
///
pub fn boot_with_tls<F>(config: &Config, tls: TlsLayout, init: F) -> Result<(), Error>
where
    F: FnOnce() + Send + 'static,
{
    let machine = Machine::bootstrap(config.machine_config(tls))?;
    let result = start(&machine, config, init);
    if result.is_err() {
        machine.halt();
    }

    // Run the boot CPU until the kernel is halted.
    machine.run_idle();
    machine.join_cpus();

    let leftover = machine.num_threads();
    if leftover > 0 {
        warn!("Kernel halted with {} threads still alive.", leftover);
    }

    machine.detach();
    info!("Kernel halted.");

    result
}

/// Brings up the secondary CPUs and starts `init`.
///
fn start<F>(machine: &Arc<Machine>, config: &Config, init: F) -> Result<(), Error>
where
    F: FnOnce() + Send + 'static,
{
    let timeout = Duration::from_millis(config.cpu_start_timeout_ms);
    for cpu in machine.cpus().present().iter() {
        if cpu != CpuId::BOOT {
            machine.cpu_up(cpu, timeout)?;
        }
    }

    info!(
        "Kernel ready with {} CPUs.",
        machine.cpus().online().count()
    );

    machine.start_kernel_thread("init", init)?;

    Ok(())
}

/// Halts the kernel.
///
/// Each CPU goes offline once it has no runnable
/// threads left, after which [`boot`] returns.
///
/// # Panics
///
/// `halt` panics if called from outside the kernel.
///
pub fn halt() {
    multitasking::current_machine().halt();
}
