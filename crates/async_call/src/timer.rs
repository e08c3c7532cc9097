// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::ERR_POISONED_LOCK;

/// The minimum resolution for delay timers. Delays shorter than this are rounded up.
const TIMER_RESOLUTION: Duration = Duration::from_millis(1);

/// Unique identity of one armed deadline.
///
/// The discriminator distinguishes timers armed for the same instant, and lets a fire
/// detect that its timer was disarmed or re-armed while the fire was in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    due: Instant,
    discriminator: u64,
}

/// A re-armable one-shot timer.
///
/// Arming schedules the callback to run once on the shared timer thread after the delay;
/// re-arming replaces the previous deadline. [`disarm_and_wait`][Self::disarm_and_wait]
/// cancels the deadline and quiesces an in-flight fire, after which the callback is
/// guaranteed not to be running and never to run again.
pub(crate) struct DelayTimer {
    shared: Arc<TimerShared>,
}

struct TimerShared {
    callback: Box<dyn Fn() + Send + Sync>,
    state: Mutex<TimerState>,
    quiesced: Condvar,
}

struct TimerState {
    armed: Option<TimerKey>,

    /// The thread currently running the callback, while a fire is in flight.
    firing: Option<ThreadId>,
}

impl DelayTimer {
    pub fn new(callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(TimerShared {
                callback: Box::new(callback),
                state: Mutex::new(TimerState {
                    armed: None,
                    firing: None,
                }),
                quiesced: Condvar::new(),
            }),
        }
    }

    /// Schedules the callback to fire once after `delay`, replacing any previous deadline.
    pub fn arm(&self, delay: Duration) {
        let now = Instant::now();
        // An unrepresentable deadline only happens for absurd delays; push it out as far as
        // the clock allows instead.
        let due = now
            .checked_add(delay.max(TIMER_RESOLUTION))
            .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365));

        let service = service();
        let mut state = self.shared.state.lock().expect(ERR_POISONED_LOCK);

        {
            let mut timers = service.timers.lock().expect(ERR_POISONED_LOCK);

            if let Some(previous) = state.armed.take() {
                _ = timers.remove(&previous);
            }

            let key = TimerKey {
                due,
                discriminator: service.next_discriminator.fetch_add(1, Ordering::Relaxed),
            };
            timers.insert(key, Arc::downgrade(&self.shared));
            state.armed = Some(key);
        }

        drop(state);
        service.wake.notify_all();
    }

    /// Cancels the deadline and blocks until an in-flight fire has finished.
    ///
    /// When called from inside the timer callback itself, the wait is skipped - the fire
    /// that is "in flight" is the caller, and waiting for it would deadlock.
    pub fn disarm_and_wait(&self) {
        let mut state = self.shared.state.lock().expect(ERR_POISONED_LOCK);

        if let Some(previous) = state.armed.take() {
            let mut timers = service().timers.lock().expect(ERR_POISONED_LOCK);
            _ = timers.remove(&previous);
        }

        while let Some(firing) = state.firing {
            if firing == thread::current().id() {
                break;
            }

            state = self.shared.quiesced.wait(state).expect(ERR_POISONED_LOCK);
        }
    }
}

impl Drop for DelayTimer {
    // Disarm without quiescing: drop may run from contexts that must not block, and the
    // service holds only a weak reference, so a late fire finds nothing to run.
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().expect(ERR_POISONED_LOCK);

        if let Some(previous) = state.armed.take() {
            let mut timers = service().timers.lock().expect(ERR_POISONED_LOCK);
            _ = timers.remove(&previous);
        }
    }
}

impl fmt::Debug for DelayTimer {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock().expect(ERR_POISONED_LOCK);
        f.debug_struct("DelayTimer")
            .field("armed", &state.armed.is_some())
            .field("firing", &state.firing.is_some())
            .finish()
    }
}

impl TimerShared {
    /// Runs the callback for a due deadline, unless the timer was disarmed or re-armed
    /// between the deadline popping and this call.
    fn fire(self: &Arc<Self>, key: TimerKey) {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

        if state.armed != Some(key) {
            return;
        }

        state.armed = None;
        state.firing = Some(thread::current().id());
        drop(state);

        (self.callback)();

        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);
        state.firing = None;
        drop(state);

        self.quiesced.notify_all();
    }
}

/// The process-wide timer service: deadlines ordered in a map, worked off by one lazily
/// spawned thread. The map holds weak references so a dropped timer cannot fire.
struct TimerService {
    timers: Mutex<BTreeMap<TimerKey, Weak<TimerShared>>>,
    wake: Condvar,
    next_discriminator: AtomicU64,
}

fn service() -> &'static TimerService {
    static SERVICE: OnceLock<TimerService> = OnceLock::new();

    SERVICE.get_or_init(|| {
        thread::Builder::new()
            .name("async-call-timer".to_string())
            .spawn(run_service)
            .expect("spawning the process-wide timer thread must succeed");

        TimerService {
            timers: Mutex::new(BTreeMap::new()),
            wake: Condvar::new(),
            next_discriminator: AtomicU64::new(0),
        }
    })
}

#[cfg_attr(test, mutants::skip)] // The timer thread's loop; mutations hang the test suite.
fn run_service() {
    let service = service();
    let mut timers = service.timers.lock().expect(ERR_POISONED_LOCK);

    loop {
        let now = Instant::now();

        match timers.first_key_value().map(|(key, _)| *key) {
            None => {
                timers = service.wake.wait(timers).expect(ERR_POISONED_LOCK);
            }
            Some(key) if key.due > now => {
                let (guard, _result) = service
                    .wake
                    .wait_timeout(timers, key.due - now)
                    .expect(ERR_POISONED_LOCK);
                timers = guard;
            }
            Some(key) => {
                let target = timers
                    .remove(&key)
                    .expect("key was read under the same lock");

                // The callback runs outside the service lock so timers can be armed and
                // disarmed from inside it.
                drop(timers);

                if let Some(shared) = target.upgrade() {
                    shared.fire(key);
                }

                timers = service.timers.lock().expect(ERR_POISONED_LOCK);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    use dispatch_testing::{TEST_TIMEOUT, eventually};

    use super::*;

    #[test]
    fn armed_timer_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));

        let timer = DelayTimer::new({
            let fired = Arc::clone(&fired);
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });
        timer.arm(Duration::from_millis(5));

        assert!(eventually(|| fired.load(Ordering::SeqCst) == 1));

        // One-shot: it does not fire again.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rearm_replaces_the_deadline() {
        let fired = Arc::new(AtomicUsize::new(0));

        let timer = DelayTimer::new({
            let fired = Arc::clone(&fired);
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });

        timer.arm(Duration::from_secs(3600));
        timer.arm(Duration::from_millis(5));

        // The near deadline fires; the far one was replaced, so the count stays at one.
        assert!(eventually(|| fired.load(Ordering::SeqCst) == 1));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disarm_prevents_the_fire() {
        let fired = Arc::new(AtomicUsize::new(0));

        let timer = DelayTimer::new({
            let fired = Arc::clone(&fired);
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });

        timer.arm(Duration::from_millis(30));
        timer.disarm_and_wait();

        thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn disarm_waits_for_an_in_flight_fire() {
        // The callback parks on a gate; disarm_and_wait must not return until the callback
        // has finished.

        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let finished = Arc::new(AtomicUsize::new(0));

        let timer = DelayTimer::new({
            let finished = Arc::clone(&finished);
            let release_rx = Mutex::new(release_rx);
            move || {
                entered_tx.send(()).expect("test keeps the receiver alive");
                release_rx
                    .lock()
                    .expect("lock")
                    .recv()
                    .expect("test keeps the sender alive");
                finished.fetch_add(1, Ordering::SeqCst);
            }
        });
        timer.arm(Duration::from_millis(1));

        entered_rx
            .recv_timeout(TEST_TIMEOUT)
            .expect("callback entered");

        let release = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            release_tx.send(()).expect("callback holds the receiver");
        });

        timer.disarm_and_wait();
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        release.join().expect("release thread panicked");
    }

    #[test]
    fn dropped_timer_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));

        let timer = DelayTimer::new({
            let fired = Arc::clone(&fired);
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });

        timer.arm(Duration::from_millis(20));
        drop(timer);

        thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
