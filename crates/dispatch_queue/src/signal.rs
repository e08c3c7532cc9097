// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::ERR_POISONED_LOCK;

/// A manual-reset signal.
///
/// Once set, every waiter (present and future) observes the signal until somebody resets it.
/// A side queue keeps its signal set exactly while entries are pending, so a dispatcher that
/// arrives late still wakes immediately.
#[derive(Debug)]
pub(crate) struct Signal {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self {
            set: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    #[cfg_attr(test, mutants::skip)] // Mutating this away hangs every waiter in the test suite.
    pub fn set(&self) {
        let mut set = self.set.lock().expect(ERR_POISONED_LOCK);
        *set = true;
        drop(set);

        self.cond.notify_all();
    }

    pub fn reset(&self) {
        let mut set = self.set.lock().expect(ERR_POISONED_LOCK);
        *set = false;
    }

    /// Waits up to `timeout` for the signal to be set. Returns whether it was observed set.
    ///
    /// A zero timeout samples the current state without blocking.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut set = self.set.lock().expect(ERR_POISONED_LOCK);

        if *set || timeout.is_zero() {
            return *set;
        }

        // An unrepresentable deadline only happens for absurd timeouts; treat those as
        // wait-forever rather than failing the wait.
        let deadline = Instant::now().checked_add(timeout);

        while !*set {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();

                    if now >= deadline {
                        return false;
                    }

                    let (guard, _result) = self
                        .cond
                        .wait_timeout(set, deadline - now)
                        .expect(ERR_POISONED_LOCK);
                    set = guard;
                }
                None => {
                    set = self.cond.wait(set).expect(ERR_POISONED_LOCK);
                }
            }
        }

        true
    }
}
