// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides a counting completion, built on the same wait/notify
//! primitives as the slot handoff.

use crate::substrate::Substrate;
use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;
use std::time::Instant;

/// Lets one worker wait until another signals that
/// some event has happened.
///
/// Each call to [`complete`](Completion::complete)
/// satisfies exactly one call to [`wait`](Completion::wait).
///
#[derive(Debug, Default)]
pub struct Completion {
    done: AtomicU32,
}

impl Completion {
    pub const fn new() -> Self {
        Completion {
            done: AtomicU32::new(0),
        }
    }

    /// Signals the completion, waking one waiter.
    ///
    pub fn complete(&self, substrate: &dyn Substrate) {
        self.done.fetch_add(1, Ordering::SeqCst);
        substrate.notify(&self.done, 1);
    }

    /// Consumes one completion if one is available.
    ///
    pub fn try_wait(&self) -> bool {
        let mut done = self.done.load(Ordering::SeqCst);
        while done > 0 {
            match self
                .done
                .compare_exchange(done, done - 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(current) => done = current,
            }
        }

        false
    }

    /// Blocks until the completion has been signalled,
    /// consuming the signal.
    ///
    pub fn wait(&self, substrate: &dyn Substrate) {
        while !self.try_wait() {
            substrate.wait(&self.done, 0, None);
        }
    }

    /// Like [`wait`](Completion::wait), but gives up
    /// once `timeout` has elapsed, returning whether the
    /// completion was consumed.
    ///
    pub fn wait_timeout(&self, substrate: &dyn Substrate, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_wait() {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            substrate.wait(&self.done, 0, Some(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::HostSubstrate;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn complete_then_wait() {
        let substrate = HostSubstrate::new();
        let completion = Completion::new();
        completion.complete(&substrate);
        completion.complete(&substrate);
        completion.wait(&substrate);
        assert!(completion.try_wait());
        assert!(!completion.try_wait());
    }

    #[test]
    fn wait_for_other_thread() {
        let substrate = Arc::new(HostSubstrate::new());
        let completion = Arc::new(Completion::new());
        let handle = {
            let substrate = substrate.clone();
            let completion = completion.clone();
            thread::spawn(move || completion.complete(&*substrate))
        };

        completion.wait(&*substrate);
        handle.join().unwrap();
    }

    #[test]
    fn timeout() {
        let substrate = HostSubstrate::new();
        let completion = Completion::new();
        assert!(!completion.wait_timeout(&substrate, Duration::from_millis(10)));
    }
}
