// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::ERR_POISONED_LOCK;

/// A manual-reset, cloneable event.
///
/// Every clone observes the same state, so an event can be handed to an operation as its
/// completion signal while the caller keeps a clone to wait on. Once set, the event stays
/// set for all present and future waiters until someone resets it.
///
/// # Thread safety
///
/// Clones may be set, reset and waited on from any thread.
#[derive(Clone, Debug, Default)]
pub struct Event {
    inner: Arc<EventInner>,
}

#[derive(Debug, Default)]
struct EventInner {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    /// Creates an event in the non-signaled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals the event, waking every waiter.
    #[cfg_attr(test, mutants::skip)] // Mutating this away hangs every waiter in the test suite.
    pub fn set(&self) {
        let mut set = self.inner.set.lock().expect(ERR_POISONED_LOCK);
        *set = true;
        drop(set);

        self.inner.cond.notify_all();
    }

    /// Returns the event to the non-signaled state.
    pub fn reset(&self) {
        let mut set = self.inner.set.lock().expect(ERR_POISONED_LOCK);
        *set = false;
    }

    /// Whether the event is currently signaled.
    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.inner.set.lock().expect(ERR_POISONED_LOCK)
    }

    /// Blocks until the event is signaled.
    pub fn wait(&self) {
        let mut set = self.inner.set.lock().expect(ERR_POISONED_LOCK);

        while !*set {
            set = self.inner.cond.wait(set).expect(ERR_POISONED_LOCK);
        }
    }

    /// Blocks up to `timeout` for the event to be signaled. Returns whether it was observed
    /// set. A zero timeout samples the current state without blocking.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut set = self.inner.set.lock().expect(ERR_POISONED_LOCK);

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
                        .inner
                        .cond
                        .wait_timeout(set, deadline - now)
                        .expect(ERR_POISONED_LOCK);
                    set = guard;
                }
                None => {
                    set = self.inner.cond.wait(set).expect(ERR_POISONED_LOCK);
                }
            }
        }

        true
    }
}
