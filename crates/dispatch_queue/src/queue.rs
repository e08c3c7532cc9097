// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{Level, event};

use crate::observers::{ObserverRegistry, SubmitObserver};
use crate::side_queue::SideQueue;
use crate::{DispatchMode, ObserverToken, SideKind, SubmissionTag, SubmitError, share};

/// The shared body of a dispatch queue.
///
/// Liveness is structural: every outward [`QueueHandle`] and every pending callback entry
/// holds a strong reference, so the queue cannot be destroyed while either exists, and
/// destruction implies both sides are empty.
pub(crate) struct QueueShared {
    work: Arc<SideQueue>,
    completion: Arc<SideQueue>,

    /// Set for queues registered in the share table; used to unlink on destruction.
    share_key: Option<share::ShareKey>,

    /// The source queues a nested or composite queue dispatches through. Held strongly so a
    /// child keeps its sources alive; sources know nothing about children, so there are no
    /// cycles.
    parents: Box<[Arc<QueueShared>]>,

    observers: ObserverRegistry,
}

impl QueueShared {
    pub fn new_standalone(
        work_mode: DispatchMode,
        completion_mode: DispatchMode,
        share_key: Option<share::ShareKey>,
    ) -> Arc<Self> {
        let queue = Arc::new_cyclic(|weak| Self {
            work: SideQueue::new(SideKind::Work, work_mode, weak.clone()),
            completion: SideQueue::new(SideKind::Completion, completion_mode, weak.clone()),
            share_key,
            parents: Box::new([]),
            observers: ObserverRegistry::new(),
        });

        event!(
            Level::DEBUG,
            ?work_mode,
            ?completion_mode,
            shared = share_key.is_some(),
            "created dispatch queue"
        );

        queue
    }

    fn new_routed(
        work: Arc<SideQueue>,
        completion: Arc<SideQueue>,
        parents: Box<[Arc<QueueShared>]>,
    ) -> Arc<Self> {
        Arc::new(Self {
            work,
            completion,
            share_key: None,
            parents,
            observers: ObserverRegistry::new(),
        })
    }

    fn side(&self, side: SideKind) -> &Arc<SideQueue> {
        match side {
            SideKind::Work => &self.work,
            SideKind::Completion => &self.completion,
        }
    }

    pub fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }
}

impl Drop for QueueShared {
    fn drop(&mut self) {
        if let Some(key) = self.share_key {
            share::unregister(key, std::ptr::from_ref(self));
        }
    }
}

impl fmt::Debug for QueueShared {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueShared")
            .field("work", &self.work)
            .field("completion", &self.completion)
            .field("shared", &self.share_key.is_some())
            .field("parents", &self.parents.len())
            .finish()
    }
}

/// A refcounted handle to a two-sided dispatch queue.
///
/// Cloning the handle is the duplicate operation: each clone is an independent reference and
/// every owner drops its own. Dropping the last handle destroys the queue once its pending
/// callbacks have drained (pending entries themselves keep the queue alive). Closing never
/// blocks.
///
/// # Thread safety
///
/// Handles may be cloned into and used from any thread.
#[derive(Clone, Debug)]
pub struct QueueHandle {
    shared: Arc<QueueShared>,
}

impl QueueHandle {
    /// Creates a standalone queue with the given dispatch mode for each side.
    ///
    /// If either side uses [`DispatchMode::Pinned`], it is pinned to the calling thread.
    #[must_use]
    pub fn new(work_mode: DispatchMode, completion_mode: DispatchMode) -> Self {
        Self {
            shared: QueueShared::new_standalone(work_mode, completion_mode, None),
        }
    }

    /// Returns the queue shared under `(id, work_mode, completion_mode)`, creating it if this
    /// is the first reference. All callers with the same triple receive the same queue.
    #[must_use]
    pub fn shared(id: u32, work_mode: DispatchMode, completion_mode: DispatchMode) -> Self {
        Self {
            shared: share::get_or_create(share::ShareKey {
                id,
                work_mode,
                completion_mode,
            }),
        }
    }

    /// Creates a queue that dispatches everything through `parent`'s work side.
    ///
    /// Both the work and the completion side of the child route to the parent's work side;
    /// a nested queue is useful for intermediate work inside a larger operation. The child
    /// holds a reference on the parent.
    #[must_use]
    pub fn nested(parent: &Self) -> Self {
        Self::composite(parent, SideKind::Work, parent, SideKind::Work)
    }

    /// Creates a queue whose sides are borrowed from two existing queues: work callbacks run
    /// on `work_side` of `work_source`, completion callbacks on `completion_side` of
    /// `completion_source`. The child holds a reference on both sources.
    #[must_use]
    pub fn composite(
        work_source: &Self,
        work_side: SideKind,
        completion_source: &Self,
        completion_side: SideKind,
    ) -> Self {
        Self {
            shared: QueueShared::new_routed(
                Arc::clone(work_source.shared.side(work_side)),
                Arc::clone(completion_source.shared.side(completion_side)),
                Box::new([
                    Arc::clone(&work_source.shared),
                    Arc::clone(&completion_source.shared),
                ]),
            ),
        }
    }

    pub(crate) fn from_shared(shared: Arc<QueueShared>) -> Self {
        Self { shared }
    }

    /// Whether two handles refer to the same queue.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// The dispatch mode of the side work submissions are routed to.
    #[must_use]
    pub fn work_mode(&self) -> DispatchMode {
        self.shared.work.mode()
    }

    /// The dispatch mode of the side completion submissions are routed to.
    #[must_use]
    pub fn completion_mode(&self) -> DispatchMode {
        self.shared.completion.mode()
    }

    /// Queues a callback on the given side.
    ///
    /// The pending entry holds a reference on this queue until it runs or is removed. After
    /// the entry is queued, the submission observers of the queue that owns the target side
    /// run synchronously on this thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the side's dispatch policy could not be engaged (for example, the
    /// pinned target thread has exited); the submission is rolled back in that case.
    pub fn submit(
        &self,
        side: SideKind,
        run: impl FnOnce() + Send + 'static,
    ) -> Result<(), SubmitError> {
        self.shared
            .side(side)
            .append(Arc::clone(&self.shared), None, Box::new(run))
    }

    /// Like [`submit`][Self::submit], but marks the entry with `tag` so it can later be
    /// withdrawn through [`remove_matching`][Self::remove_matching].
    pub fn submit_tagged(
        &self,
        side: SideKind,
        tag: SubmissionTag,
        run: impl FnOnce() + Send + 'static,
    ) -> Result<(), SubmitError> {
        self.shared
            .side(side)
            .append(Arc::clone(&self.shared), Some(tag), Box::new(run))
    }

    /// Runs the oldest pending callback of the given side on the calling thread.
    ///
    /// If the side is empty, waits up to `timeout` for a submission to arrive and runs it.
    /// Returns whether a callback ran. This is how [`DispatchMode::Manual`] sides make
    /// progress, but it may be used to drain any side regardless of its mode.
    pub fn dispatch_one(&self, side: SideKind, timeout: Duration) -> bool {
        let queue = self.shared.side(side);

        if queue.drain_one(false) {
            return true;
        }

        if !timeout.is_zero() && queue.wait(timeout) {
            return queue.drain_one(false);
        }

        false
    }

    /// Whether the given side currently has no pending callbacks.
    #[must_use]
    pub fn is_empty(&self, side: SideKind) -> bool {
        self.shared.side(side).is_empty()
    }

    /// Removes every pending entry on `side` whose tag satisfies `predicate`.
    ///
    /// Call this before tearing down an object that queued tagged callbacks, so no orphaned
    /// callback can run against it later. Removal is atomic with respect to dispatch.
    /// Untagged entries are never removed. The predicate runs under the side's lock and must
    /// not reenter the queue.
    pub fn remove_matching(&self, side: SideKind, predicate: impl FnMut(SubmissionTag) -> bool) {
        self.shared.side(side).remove_matching(predicate);
    }

    /// Registers an observer invoked after every successful submission onto either side of
    /// this queue, on the submitting thread, before the submission call returns.
    ///
    /// Submissions routed here from a nested or composite child fire this queue's observers
    /// (not the child's) and report the side they were physically appended to.
    pub fn add_submit_observer(
        &self,
        observer: impl Fn(&QueueHandle, SideKind) + Send + Sync + 'static,
    ) -> ObserverToken {
        let observer: SubmitObserver = Arc::new(observer);
        self.shared.observers.add(observer)
    }

    /// Removes a previously registered submission observer. Unknown tokens are ignored.
    pub fn remove_submit_observer(&self, token: ObserverToken) {
        self.shared.observers.remove(token);
    }
}
