// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use std::{fmt, mem};

use crate::{ERR_POISONED_LOCK, SubmitError};

type Post = Box<dyn FnOnce() + Send>;

/// Every thread lazily owns one post slot, registered through a thread local. Other threads
/// push drain tasks into the slot; the owning thread runs them from inside
/// [`alertable_sleep`]. When the thread exits, the thread local guard closes the slot so
/// later posts fail instead of queueing forever.
struct Slot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

struct SlotState {
    posts: VecDeque<Post>,
    closed: bool,
}

impl Slot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState {
                posts: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        })
    }
}

impl fmt::Debug for Slot {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().expect(ERR_POISONED_LOCK);
        f.debug_struct("Slot")
            .field("posts", &state.posts.len())
            .field("closed", &state.closed)
            .finish()
    }
}

struct SlotGuard {
    slot: Arc<Slot>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut state = self.slot.state.lock().expect(ERR_POISONED_LOCK);
        state.closed = true;
        let abandoned = mem::take(&mut state.posts);
        drop(state);

        // Abandoned posts own queue references; dropping them must happen outside the slot
        // lock because releasing a queue can run arbitrary teardown.
        drop(abandoned);
    }
}

thread_local! {
    static CURRENT_SLOT: SlotGuard = SlotGuard { slot: Slot::new() };
}

/// A posting handle to the thread that created it.
#[derive(Debug, Clone)]
pub(crate) struct PinnedThread {
    thread_id: ThreadId,
    slot: Arc<Slot>,
}

impl PinnedThread {
    /// Captures the calling thread as a pinned dispatch target.
    pub fn current() -> Self {
        Self {
            thread_id: thread::current().id(),
            slot: CURRENT_SLOT.with(|guard| Arc::clone(&guard.slot)),
        }
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Queues `post` for execution during the target thread's next alertable sleep.
    pub fn post(&self, post: Post) -> Result<(), SubmitError> {
        let mut state = self.slot.state.lock().expect(ERR_POISONED_LOCK);

        if state.closed {
            return Err(SubmitError::TargetThreadGone);
        }

        state.posts.push_back(post);
        drop(state);

        self.cond_notify();
        Ok(())
    }

    #[cfg_attr(test, mutants::skip)] // Mutating this away hangs every pinned wait in the suite.
    fn cond_notify(&self) {
        self.slot.cond.notify_all();
    }
}

/// Puts the calling thread into an alertable wait for up to `timeout`.
///
/// Posts targeted at this thread (queued by [`DispatchMode::Pinned`][crate::DispatchMode]
/// sides) run here, on this thread, with no locks held. The function returns as soon as at
/// least one post has run, or when the timeout elapses with nothing to do. A zero timeout
/// runs whatever is already queued and returns immediately; pinned sides rely on that to
/// flush a stale drain post.
///
/// Returns whether any post ran.
pub fn alertable_sleep(timeout: Duration) -> bool {
    let slot = CURRENT_SLOT.with(|guard| Arc::clone(&guard.slot));
    let deadline = Instant::now().checked_add(timeout);
    let mut ran_any = false;

    loop {
        let batch: Vec<Post> = {
            let mut state = slot.state.lock().expect(ERR_POISONED_LOCK);
            state.posts.drain(..).collect()
        };

        if !batch.is_empty() {
            ran_any = true;

            for post in batch {
                post();
            }

            // A post may have queued follow-up posts; pick those up before returning.
            continue;
        }

        if ran_any || timeout.is_zero() {
            return ran_any;
        }

        let mut state = slot.state.lock().expect(ERR_POISONED_LOCK);

        while state.posts.is_empty() {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();

                    if now >= deadline {
                        return ran_any;
                    }

                    let (guard, _result) = slot
                        .cond
                        .wait_timeout(state, deadline - now)
                        .expect(ERR_POISONED_LOCK);
                    state = guard;
                }
                None => {
                    state = slot.cond.wait(state).expect(ERR_POISONED_LOCK);
                }
            }
        }
    }
}
