// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Abstracts the host primitives used to run and park workers.

use crate::Error;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use core::time::Duration;
use parking_lot_core::{
    FilterOp, ParkResult, ParkToken, DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN,
};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// The code run by a new worker thread.
///
pub type WorkerEntry = Box<dyn FnOnce() + Send + 'static>;

/// The outcome of a call to [`Substrate::wait`].
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// The worker blocked and was later woken.
    ///
    Woken,

    /// The word no longer held the expected value,
    /// so the worker did not block.
    ///
    Mismatch,

    /// The timeout elapsed before the worker was woken.
    ///
    TimedOut,
}

/// An atomic word that workers can wait on.
///
/// Waiters and notifiers are matched by the word's
/// address, so a word must not move while a worker
/// may be waiting on it.
///
pub trait AtomicWord: Sync {
    /// Returns the address used to match waiters
    /// and notifiers.
    ///
    fn address(&self) -> usize;

    /// Loads the current value, widened to 64 bits.
    ///
    fn load_word(&self) -> u64;
}

impl AtomicWord for AtomicU32 {
    fn address(&self) -> usize {
        self as *const AtomicU32 as usize
    }

    fn load_word(&self) -> u64 {
        self.load(Ordering::SeqCst) as u64
    }
}

impl AtomicWord for AtomicU64 {
    fn address(&self) -> usize {
        self as *const AtomicU64 as usize
    }

    fn load_word(&self) -> u64 {
        self.load(Ordering::SeqCst)
    }
}

/// The host primitives underneath the scheduler.
///
pub trait Substrate: Send + Sync + 'static {
    /// Starts a new worker thread, which runs `entry`
    /// in parallel with the caller.
    ///
    fn spawn_worker(&self, name: &str, entry: WorkerEntry) -> Result<Worker, Error>;

    /// Blocks the calling worker while `cell` holds
    /// `expected`, or until `timeout` elapses.
    ///
    /// The comparison and the decision to block are
    /// atomic with respect to [`notify`](Substrate::notify),
    /// so a store followed by a notify is never missed.
    /// Spurious wakeups are permitted.
    ///
    fn wait(&self, cell: &dyn AtomicWord, expected: u64, timeout: Option<Duration>)
        -> WaitResult;

    /// Wakes up to `max_wake` workers blocked on `cell`,
    /// returning the number woken.
    ///
    fn notify(&self, cell: &dyn AtomicWord, max_wake: u32) -> u32;
}

/// A handle to a worker thread.
///
pub struct Worker {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Returns a handle for a worker that was not
    /// started by the substrate, such as the thread
    /// that booted the kernel.
    ///
    pub fn adopted(name: &str) -> Self {
        Worker {
            name: name.to_string(),
            handle: None,
        }
    }

    /// Returns the worker's name.
    ///
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether this worker can be joined.
    ///
    pub fn is_joinable(&self) -> bool {
        self.handle.is_some()
    }

    /// Waits for the worker to terminate, returning
    /// `false` if it terminated by panicking.
    ///
    /// Joining an adopted worker returns immediately.
    ///
    pub fn join(mut self) -> bool {
        match self.handle.take() {
            Some(handle) => handle.join().is_ok(),
            None => true,
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("joinable", &self.is_joinable())
            .finish()
    }
}

/// Implements [`Substrate`] with native threads.
///
/// Waiting workers are parked in a global parking lot,
/// keyed on the address of the word they wait on.
///
#[derive(Clone, Copy, Debug, Default)]
pub struct HostSubstrate;

impl HostSubstrate {
    pub const fn new() -> Self {
        HostSubstrate
    }
}

impl Substrate for HostSubstrate {
    fn spawn_worker(&self, name: &str, entry: WorkerEntry) -> Result<Worker, Error> {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(entry)
            .map_err(|source| Error::WorkerSpawn {
                name: name.to_string(),
                source,
            })?;

        Ok(Worker {
            name: name.to_string(),
            handle: Some(handle),
        })
    }

    fn wait(
        &self,
        cell: &dyn AtomicWord,
        expected: u64,
        timeout: Option<Duration>,
    ) -> WaitResult {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let validate = || cell.load_word() == expected;

        // The validation runs with the parking lot's
        // bucket locked, which is also held by notify,
        // so no wakeup can slip in between the check
        // and going to sleep.
        let result = unsafe {
            parking_lot_core::park(
                cell.address(),
                validate,
                || {},
                |_, _| {},
                DEFAULT_PARK_TOKEN,
                deadline,
            )
        };

        match result {
            ParkResult::Unparked(_) => WaitResult::Woken,
            ParkResult::Invalid => WaitResult::Mismatch,
            ParkResult::TimedOut => WaitResult::TimedOut,
        }
    }

    fn notify(&self, cell: &dyn AtomicWord, max_wake: u32) -> u32 {
        let mut remaining = max_wake;
        let filter = |_: ParkToken| {
            if remaining == 0 {
                FilterOp::Stop
            } else {
                remaining -= 1;
                FilterOp::Unpark
            }
        };

        let result = unsafe {
            parking_lot_core::unpark_filter(cell.address(), filter, |_| DEFAULT_UNPARK_TOKEN)
        };

        result.unparked_threads as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn wait_on_changed_value() {
        let substrate = HostSubstrate::new();
        let word = AtomicU32::new(7);
        assert_eq!(substrate.wait(&word, 3, None), WaitResult::Mismatch);
    }

    #[test]
    fn wait_timeout() {
        let substrate = HostSubstrate::new();
        let word = AtomicU64::new(0);
        let result = substrate.wait(&word, 0, Some(Duration::from_millis(5)));
        assert_eq!(result, WaitResult::TimedOut);
    }

    #[test]
    fn notify_without_waiters() {
        let substrate = HostSubstrate::new();
        let word = AtomicU32::new(0);
        assert_eq!(substrate.notify(&word, u32::MAX), 0);
    }

    #[test]
    fn spawn_and_wake() {
        let substrate = Arc::new(HostSubstrate::new());
        let word = Arc::new(AtomicU32::new(0));

        let entry = {
            let substrate = substrate.clone();
            let word = word.clone();
            Box::new(move || {
                while word.load(Ordering::SeqCst) == 0 {
                    substrate.wait(&*word, 0, None);
                }
            })
        };

        let worker = substrate.spawn_worker("waiter", entry).unwrap();

        assert_eq!(worker.name(), "waiter");
        assert!(worker.is_joinable());
        word.store(1, Ordering::SeqCst);
        substrate.notify(&*word, 1);
        assert!(worker.join());
    }

    #[test]
    fn adopted_worker_joins_immediately() {
        let worker = Worker::adopted("boot");
        assert!(!worker.is_joinable());
        assert!(worker.join());
    }
}
