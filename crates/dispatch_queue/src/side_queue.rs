// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::queue::QueueShared;
use crate::signal::Signal;
use crate::{
    DispatchMode, ERR_POISONED_LOCK, QueueHandle, SideKind, SubmitError, pinned, pool,
};

/// Identifies a family of related submissions so they can be removed together.
///
/// Closures have no comparable identity, so a submission that may later need to be withdrawn
/// (for example, the queued work of an async operation that is being torn down) carries an
/// explicit tag. [`QueueHandle::remove_matching`] sees tags only; untagged submissions are
/// never removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubmissionTag(pub u64);

/// One queued callback.
///
/// The `owner` field is the strong reference every pending entry holds on the queue it was
/// submitted through; it is what keeps a queue alive until its outstanding callbacks have run
/// or been removed. For submissions routed through a nested queue this is the child, not the
/// queue that owns the side the entry physically sits in.
struct Entry {
    id: u64,
    tag: Option<SubmissionTag>,
    owner: Arc<QueueShared>,
    run: Box<dyn FnOnce() + Send>,
}

struct SideState {
    entries: VecDeque<Entry>,

    /// Whether a drain task is already on its way to the pinned thread. Guarded by the same
    /// mutex as the entry list; only meaningful for `DispatchMode::Pinned`.
    dispatch_posted: bool,
}

/// One side of a dispatch queue: a FIFO of pending callbacks plus the dispatch policy that
/// decides which thread runs them.
///
/// The mutex guards the entry list and the posted flag and is never held across a callback
/// invocation, so callbacks are free to reenter the same queue. The signal is set exactly
/// while entries are pending.
pub(crate) struct SideQueue {
    kind: SideKind,
    mode: DispatchMode,

    /// The queue that created this side. Weak because the queue owns the side; used to fan
    /// out submission observers, which always belong to the side's creator even when a
    /// submission arrives through a nested child.
    owner: Weak<QueueShared>,

    state: Mutex<SideState>,
    signal: Signal,
    next_entry_id: AtomicU64,

    /// The dispatch target for `DispatchMode::Pinned`, captured at creation time.
    pinned: Option<pinned::PinnedThread>,
}

impl SideQueue {
    pub fn new(kind: SideKind, mode: DispatchMode, owner: Weak<QueueShared>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            mode,
            owner,
            state: Mutex::new(SideState {
                entries: VecDeque::new(),
                dispatch_posted: false,
            }),
            signal: Signal::new(),
            next_entry_id: AtomicU64::new(0),
            pinned: (mode == DispatchMode::Pinned).then(pinned::PinnedThread::current),
        })
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Appends a callback and kicks the side's dispatch policy.
    ///
    /// On success the entry holds a reference on `owner` until it runs or is removed, and the
    /// owning queue's submission observers have been invoked on the calling thread. On
    /// failure all bookkeeping has been rolled back.
    pub fn append(
        self: &Arc<Self>,
        owner: Arc<QueueShared>,
        tag: Option<SubmissionTag>,
        run: Box<dyn FnOnce() + Send>,
    ) -> Result<(), SubmitError> {
        let id = self.next_entry_id.fetch_add(1, Ordering::Relaxed);

        let post_drain = {
            let mut state = self.state.lock().expect(ERR_POISONED_LOCK);
            state.entries.push_back(Entry {
                id,
                tag,
                owner,
                run,
            });
            self.signal.set();

            // A single drain task covers every entry present when it runs, so only the first
            // submission after an idle period posts one.
            let post_drain =
                self.mode == DispatchMode::Pinned && !state.dispatch_posted;
            if post_drain {
                state.dispatch_posted = true;
            }

            post_drain
        };

        match self.mode {
            DispatchMode::Pinned if post_drain => {
                let target = self
                    .pinned
                    .as_ref()
                    .expect("pinned sides always capture their thread at creation");
                let queue = Arc::clone(self);

                if let Err(error) = target.post(Box::new(move || queue.drain_all(true))) {
                    self.roll_back_append(id);
                    return Err(error);
                }
            }
            DispatchMode::Pool => {
                let queue = Arc::clone(self);
                pool::global().execute(move || queue.drain_all(false));
            }
            DispatchMode::Manual | DispatchMode::Pinned => {}
        }

        if let Some(owner) = self.owner.upgrade() {
            let handle = QueueHandle::from_shared(Arc::clone(&owner));
            owner.observers().invoke(&handle, self.kind);
        }

        Ok(())
    }

    /// Unlinks a freshly appended entry after a failed cross-thread post, releasing the
    /// reference it held.
    fn roll_back_append(&self, id: u64) {
        let entry = {
            let mut state = self.state.lock().expect(ERR_POISONED_LOCK);
            state.dispatch_posted = false;

            let position = state.entries.iter().position(|entry| entry.id == id);
            position.and_then(|index| state.entries.remove(index))
        };

        drop(entry);
    }

    /// Pops and runs the oldest entry, if any. The callback runs outside every lock.
    ///
    /// `inside_pinned_dispatch` is true when the caller is the drain task posted to a pinned
    /// thread; finding the queue empty then retires the post so the next submission knows to
    /// post again.
    pub fn drain_one(&self, inside_pinned_dispatch: bool) -> bool {
        let entry = {
            let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

            match state.entries.pop_front() {
                Some(entry) => Some(entry),
                None => {
                    self.signal.reset();
                    if inside_pinned_dispatch {
                        state.dispatch_posted = false;
                    }
                    None
                }
            }
        };

        match entry {
            Some(entry) => {
                let Entry { owner, run, .. } = entry;
                run();

                // The entry's reference on its queue is released only after the callback has
                // run; this is what lets a callback be the final owner of its own queue.
                drop(owner);
                true
            }
            None => false,
        }
    }

    #[cfg_attr(test, mutants::skip)] // Mutating the loop away strands entries and hangs tests.
    pub fn drain_all(&self, inside_pinned_dispatch: bool) {
        while self.drain_one(inside_pinned_dispatch) {}
    }

    /// Removes every tagged entry whose tag satisfies `predicate`.
    ///
    /// Removal is atomic with respect to dispatch: an entry is either removed here or runs,
    /// never both. The predicate runs under the side's mutex and must not reenter the queue.
    pub fn remove_matching(&self, mut predicate: impl FnMut(SubmissionTag) -> bool) {
        let (removed, emptied) = {
            let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

            let mut kept = VecDeque::with_capacity(state.entries.len());
            let mut removed = Vec::new();

            for entry in state.entries.drain(..) {
                match entry.tag {
                    Some(tag) if predicate(tag) => removed.push(entry),
                    _ => kept.push_back(entry),
                }
            }

            state.entries = kept;

            let emptied = state.entries.is_empty();
            if emptied {
                self.signal.reset();
            }

            (removed, emptied)
        };

        // Dropping removed entries releases their queue references, which can run arbitrary
        // teardown; that must happen outside the mutex.
        drop(removed);

        // If this side dispatches to the calling thread and is now empty, flush any drain
        // task that was posted before the removal. Otherwise that stale post would fire later
        // and find a queue whose owner may already be gone.
        if emptied
            && self.mode == DispatchMode::Pinned
            && self
                .pinned
                .as_ref()
                .is_some_and(pinned::PinnedThread::is_current)
        {
            _ = pinned::alertable_sleep(Duration::ZERO);
        }
    }

    /// Blocks up to `timeout` for the side to become (or already be) non-empty.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.signal.wait(timeout)
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().expect(ERR_POISONED_LOCK).entries.is_empty()
    }
}

impl fmt::Debug for SideQueue {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().expect(ERR_POISONED_LOCK);
        f.debug_struct("SideQueue")
            .field("kind", &self.kind)
            .field("mode", &self.mode)
            .field("entries", &state.entries.len())
            .field("dispatch_posted", &state.dispatch_posted)
            .finish()
    }
}
