// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dispatch_queue::QueueHandle;

use crate::error::bits;
use crate::state::AsyncState;
use crate::{ERR_POISONED_LOCK, Error, Event};

pub(crate) type CompletionCallback = Box<dyn Fn(&AsyncBlock) + Send + Sync>;

/// The caller-owned control block of an asynchronous operation.
///
/// A block is a cloneable handle: the initiator keeps one, the operation keeps one, and a
/// completion callback receives one. It carries the operation's status word, the optional
/// queue and completion callback it was built with, and - between
/// [`begin`][AsyncBlock::begin] and release - the operation's internal state.
///
/// A block outlives any single operation and may be reused for a new `begin` once the
/// previous operation's state has been released (after its result was consumed, it was
/// canceled, or it completed without a payload).
///
/// # Thread safety
///
/// Clones may be used from any thread.
#[derive(Clone)]
pub struct AsyncBlock {
    core: Arc<BlockCore>,
}

struct BlockCore {
    /// The queue operations on this block run on; `None` selects the per-thread default
    /// queue at begin time.
    queue: Option<QueueHandle>,

    /// Invoked exactly once per finalized operation, on the queue's completion side.
    callback: Option<CompletionCallback>,

    /// A caller-supplied event to signal on completion instead of a fresh one.
    wait_event: Option<Event>,

    /// The operation status, bit-packed. Terminal transitions go through a single
    /// compare-and-swap keyed on the pending sentinel, so exactly one finalizer wins.
    status: AtomicU64,

    /// The operation state while one is in flight. This slot is the only route to the
    /// state; taking it out is the release.
    state: Mutex<Option<Arc<AsyncState>>>,
}

impl AsyncBlock {
    /// Creates a block with no queue, callback or caller event.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building a block.
    #[must_use]
    pub fn builder() -> AsyncBlockBuilder {
        AsyncBlockBuilder {
            queue: None,
            callback: None,
            wait_event: None,
        }
    }

    pub(crate) fn queue(&self) -> Option<&QueueHandle> {
        self.core.queue.as_ref()
    }

    pub(crate) fn has_completion_callback(&self) -> bool {
        self.core.callback.is_some()
    }

    pub(crate) fn invoke_completion_callback(&self) {
        if let Some(callback) = &self.core.callback {
            callback(self);
        }
    }

    pub(crate) fn wait_event(&self) -> Option<&Event> {
        self.core.wait_event.as_ref()
    }

    /// The current status word, without any waiting.
    pub(crate) fn load_status(&self) -> Result<(), Error> {
        bits::decode(self.core.status.load(Ordering::Acquire))
    }

    pub(crate) fn mark_pending(&self) {
        self.core.status.store(bits::PENDING, Ordering::Release);
    }

    /// Attempts the pending-to-terminal transition and returns the prior status. The caller
    /// won exactly when the prior status was pending.
    pub(crate) fn finalize(&self, status: Result<(), Error>) -> Result<(), Error> {
        debug_assert!(
            status != Err(Error::Pending),
            "pending is the sentinel finalize transitions away from"
        );

        let prior = match self.core.status.compare_exchange(
            bits::PENDING,
            bits::encode(status),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(prior) | Err(prior) => prior,
        };

        bits::decode(prior)
    }

    /// Binds a new operation's state. Fails without disturbing anything if the block is
    /// already bound to a live operation.
    pub(crate) fn bind_state(&self, state: Arc<AsyncState>) -> Result<(), Error> {
        let mut slot = self.core.state.lock().expect(ERR_POISONED_LOCK);

        if slot.is_some() {
            return Err(Error::InvalidState);
        }

        *slot = Some(state);
        Ok(())
    }

    pub(crate) fn state(&self) -> Option<Arc<AsyncState>> {
        self.core.state.lock().expect(ERR_POISONED_LOCK).clone()
    }

    pub(crate) fn take_state(&self) -> Option<Arc<AsyncState>> {
        self.core.state.lock().expect(ERR_POISONED_LOCK).take()
    }
}

impl Default for AsyncBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AsyncBlock {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncBlock")
            .field("status", &self.load_status())
            .field("bound", &self.core.state.lock().expect(ERR_POISONED_LOCK).is_some())
            .field("has_queue", &self.core.queue.is_some())
            .field("has_callback", &self.core.callback.is_some())
            .finish()
    }
}

/// Builds an [`AsyncBlock`].
pub struct AsyncBlockBuilder {
    queue: Option<QueueHandle>,
    callback: Option<CompletionCallback>,
    wait_event: Option<Event>,
}

impl AsyncBlockBuilder {
    /// Runs the block's operations on `queue` instead of the per-thread default queue.
    #[must_use]
    pub fn queue(mut self, queue: QueueHandle) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Invokes `callback` on the queue's completion side when an operation on this block
    /// finalizes. The callback fires exactly once per begun operation.
    #[must_use]
    pub fn completion_callback(
        mut self,
        callback: impl Fn(&AsyncBlock) + Send + Sync + 'static,
    ) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Signals `event` on completion instead of an internally created event. The caller is
    /// responsible for resetting a reused event between operations.
    #[must_use]
    pub fn wait_event(mut self, event: Event) -> Self {
        self.wait_event = Some(event);
        self
    }

    /// Finishes the block. Its status reads as terminal success until
    /// [`begin`][AsyncBlock::begin] marks it pending.
    #[must_use]
    pub fn build(self) -> AsyncBlock {
        AsyncBlock {
            core: Arc::new(BlockCore {
                queue: self.queue,
                callback: self.callback,
                wait_event: self.wait_event,
                status: AtomicU64::new(bits::OK),
                state: Mutex::new(None),
            }),
        }
    }
}

impl fmt::Debug for AsyncBlockBuilder {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncBlockBuilder")
            .field("has_queue", &self.queue.is_some())
            .field("has_callback", &self.callback.is_some())
            .field("has_wait_event", &self.wait_event.is_some())
            .finish()
    }
}
