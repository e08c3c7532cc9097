// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// Determines which thread invokes the callbacks queued on one side of a dispatch queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchMode {
    /// Callbacks are only invoked by an explicit call to
    /// [`QueueHandle::dispatch_one`][crate::QueueHandle::dispatch_one], on whatever thread
    /// makes that call.
    Manual,

    /// Callbacks are invoked on the thread that created the side, while that thread is inside
    /// [`alertable_sleep`][crate::alertable_sleep].
    Pinned,

    /// Callbacks are invoked on a shared worker pool. Two submissions may execute concurrently
    /// on different workers; callbacks must tolerate this.
    Pool,
}

/// Selects one of the two callback streams inside a dispatch queue.
///
/// The two sides are independent: each has its own FIFO order and its own dispatch mode, and
/// there is no ordering between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SideKind {
    /// The side that carries the work of asynchronous calls.
    Work,

    /// The side that carries completion notifications back to the caller.
    Completion,
}
